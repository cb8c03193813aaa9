//! One-shot readiness notification
//!
//! The manager owns the [`ReadinessTrigger`] and fires it exactly once, when
//! it holds leadership and its caches are synced. Anyone holding a
//! [`ReadinessSignal`] can wait for that moment but cannot cause it.
//!
//! Waiting has no timeout. If the trigger is dropped without firing (the
//! manager died during startup) waiters are released with an error instead
//! of hanging.

use tokio::sync::watch;

use crate::Error;

/// Create a connected trigger/signal pair
pub fn readiness() -> (ReadinessTrigger, ReadinessSignal) {
    let (tx, rx) = watch::channel(false);
    (ReadinessTrigger { tx }, ReadinessSignal { rx })
}

/// Write side, consumed on use so it can only fire once
#[derive(Debug)]
pub struct ReadinessTrigger {
    tx: watch::Sender<bool>,
}

impl ReadinessTrigger {
    /// Mark the manager ready and wake every waiter
    pub fn fire(self) {
        self.tx.send_replace(true);
    }
}

/// Observer side of the readiness notification
#[derive(Debug, Clone)]
pub struct ReadinessSignal {
    rx: watch::Receiver<bool>,
}

impl ReadinessSignal {
    /// Whether the signal has already fired
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Block until the signal fires
    pub async fn wait(&self) -> Result<(), Error> {
        let mut rx = self.rx.clone();
        rx.wait_for(|ready| *ready).await.map(|_| ()).map_err(|_| {
            Error::manager_runtime("manager dropped its readiness signal before becoming ready")
        })
    }
}
