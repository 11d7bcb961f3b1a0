use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

/// Level-triggered "network is up" flag. The network collaborator sets and
/// clears it; the OTA task blocks on it before touching the network.
#[derive(Clone, Default)]
pub struct NetworkSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl NetworkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        let (flag, condvar) = &*self.inner;
        let mut guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = connected;
        if connected {
            condvar.notify_all();
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until connected or until `timeout` elapses. Returns whether the
    /// flag was set; returns immediately if already connected.
    pub fn wait_connected_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |connected| !*connected)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}
