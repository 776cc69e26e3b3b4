//! Cooperative shutdown signal shared by the bridge loops.

use tokio::sync::watch;

/// Sending half: flips every [`Shutdown`] listener at once.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Listening half, cloned into every loop.
///
/// Dropping the [`ShutdownTrigger`] counts as a shutdown request.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn recv(&mut self) {
        if self.is_shutdown() {
            return;
        }
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}
