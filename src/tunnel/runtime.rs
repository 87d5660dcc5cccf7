//! Process-wide SSH runtime shared by every live tunnel.
//!
//! The first [`SshRuntime::acquire`] builds the shared client configuration;
//! the last handle to be dropped tears it down again. The registry only holds
//! a weak reference, so the strong count is the number of live users.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use russh::client;
use tracing::info;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_MAX: usize = 3;

static RUNTIME: Mutex<Weak<RuntimeInner>> = Mutex::new(Weak::new());

struct RuntimeInner {
    client_config: Arc<client::Config>,
}

impl RuntimeInner {
    fn new() -> Self {
        let config = client::Config {
            // Database connections sit idle for long stretches; rely on
            // keepalives instead of an inactivity timeout.
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            nodelay: true,
            ..Default::default()
        };

        Self {
            client_config: Arc::new(config),
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        info!("SSH runtime released");
    }
}

/// Reference-counted handle to the shared SSH runtime
#[derive(Clone)]
pub struct SshRuntime {
    inner: Arc<RuntimeInner>,
}

impl SshRuntime {
    pub fn acquire() -> Self {
        let mut slot = RUNTIME.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(inner) = slot.upgrade() {
            return Self { inner };
        }

        let inner = Arc::new(RuntimeInner::new());
        *slot = Arc::downgrade(&inner);
        info!("SSH runtime initialized");

        Self { inner }
    }

    /// Client configuration used for every session opened through this runtime
    pub fn client_config(&self) -> Arc<client::Config> {
        self.inner.client_config.clone()
    }

    /// Number of live handles across the process
    pub fn active_users() -> usize {
        RUNTIME
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .strong_count()
    }
}
