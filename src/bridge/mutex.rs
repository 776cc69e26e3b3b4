//! Exclusive access to the shared serial channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::debug;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{BridgeError, BridgeResult};
use crate::serial::{ChannelState, SerialChannel};
use crate::shutdown::Shutdown;

/// A serial transaction borrowing the open channel for its whole duration.
pub type Transaction<'c, T> = Pin<Box<dyn Future<Output = BridgeResult<T>> + Send + 'c>>;

/// The single gate in front of [`SerialChannel`].
///
/// Waiters are served in arrival order (tokio's mutex is fair); there is no priority
/// between the loops, so a long telemetry read delays a pending method call.
#[derive(Clone)]
pub struct ChannelMutex {
    inner: Arc<Mutex<SerialChannel>>,
}

/// Holds the lock for one transaction. Dropped without being disarmed (panic inside
/// the transaction, or the transaction future being dropped) it faults the channel,
/// since a half-finished exchange leaves the line protocol out of step.
struct TransactionGuard<'a> {
    chan: MutexGuard<'a, SerialChannel>,
    armed: bool,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.chan.fault("transaction abandoned before completion");
        }
    }
}

impl ChannelMutex {
    pub fn new(channel: SerialChannel) -> Self {
        Self {
            inner: Arc::new(Mutex::new(channel)),
        }
    }

    /// Run `f` with exclusive access to an open channel.
    ///
    /// Waits for the lock, reconnects if the channel is down (retrying until it
    /// succeeds or shutdown is requested), runs the transaction and releases the lock
    /// on every exit path. Transport and unexpected errors fault the channel before
    /// the lock is released so the next holder starts from a fresh connection.
    pub async fn with_channel<T, F>(&self, shutdown: &mut Shutdown, f: F) -> BridgeResult<T>
    where
        F: for<'c> FnOnce(&'c mut SerialChannel) -> Transaction<'c, T>,
    {
        let chan = tokio::select! {
            guard = self.inner.lock() => guard,
            _ = shutdown.recv() => return Err(BridgeError::Shutdown),
        };
        let mut txn = TransactionGuard { chan, armed: false };
        txn.chan.acquire_open(shutdown).await?;

        txn.armed = true;
        let result = f(&mut *txn.chan).await;
        txn.armed = false;

        if let Err(e) = &result {
            if e.faults_channel() {
                txn.chan.fault(&e.to_string());
            } else {
                debug!("Serial transaction ended without fault: {}", e);
            }
        }
        result
    }

    /// Current channel state. Waits for any running transaction to finish.
    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state()
    }

    /// Whether some loop currently holds the channel.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
