use thiserror::Error;

use crate::command::CommandError;

/// Failures of the physical serial link. Always recoverable by reconnecting.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The port could not be opened (missing device, permissions, busy).
    #[error("failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    /// Read or write failure on an open port. Displays the underlying text unchanged
    /// so it can be handed back to a method caller verbatim.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted on a channel that has no live link.
    #[error("serial channel is not open")]
    NotOpen,
}

/// Errors surfaced by a bridge transaction or loop iteration.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Rejected by the command vocabulary before reaching the device.
    #[error("{0}")]
    InvalidCommand(#[from] CommandError),

    /// The cloud collaborator failed to accept or deliver an item.
    #[error("cloud client error: {0}")]
    Cloud(String),

    /// Anything else that went wrong inside a serial transaction.
    #[error("unexpected error: {0}")]
    Unexpected(String),

    /// The bridge is shutting down; the transaction was abandoned.
    #[error("bridge is shutting down")]
    Shutdown,
}

impl BridgeError {
    /// Whether this error should tear down the serial link before the mutex is released.
    pub fn faults_channel(&self) -> bool {
        matches!(self, BridgeError::Transport(_) | BridgeError::Unexpected(_))
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
