//! One-shot shutdown signal shared by a lockdown session, its heartbeat and
//! every service stream started from it.

use std::sync::Arc;
use tokio::sync::watch;

/// A broadcast flag that can be raised exactly once.
///
/// Clones observe the same flag. Reading never blocks; [`ShutdownSignal::wait`]
/// suspends until the flag is raised.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Raises the signal. Returns `true` only for the call that actually set it.
    pub fn raise(&self) -> bool {
        self.tx.send_if_modified(|set| {
            if *set {
                false
            } else {
                *set = true;
                true
            }
        })
    }

    /// Resolves once the signal has been raised
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set
        let _ = rx.wait_for(|set| *set).await;
    }
}
