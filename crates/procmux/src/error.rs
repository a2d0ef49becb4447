use procmux_packets::PacketError;
use procmux_transport::TransportError;

/// Errors that can occur while bringing up or tearing down the launcher.
///
/// Per-process failures are not errors at this level; they reach the caller
/// through its endpoint as `ProcessError` notifications.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Packet-level error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// The launcher thread could not be spawned.
    #[error("failed to spawn launcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LaunchError>;
