use std::fmt;

/// Sequence number of an accepted client connection within one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Returns this id and advances `self` to the next one
    pub fn next(&mut self) -> ConnectionId {
        let id = *self;
        self.0 += 1;
        id
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(n: u64) -> Self {
        ConnectionId(n)
    }
}
