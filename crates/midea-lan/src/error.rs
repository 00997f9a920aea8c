//! Session error kinds

use midea_proto::ProtocolError;
use thiserror::Error;

/// Errors surfaced by discovery and device sessions
#[derive(Debug, Error)]
pub enum SessionError {
    /// TCP connect failed or timed out
    #[error("connect failed: {0}")]
    Connect(String),

    /// Handshake failed; the session terminates and must be reopened
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No reply arrived within the response window
    #[error("response timeout")]
    ResponseTimeout,

    /// Every query in the refresh cycle is unsupported by the appliance
    #[error("all status queries unsupported by appliance")]
    RefreshFailed,

    /// No inbound traffic for the idle window; the socket was dropped
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// The session is not in the ready state
    #[error("session not connected")]
    NotConnected,

    /// The session has been closed
    #[error("session closed")]
    Closed,

    /// Malformed token or key material
    #[error("invalid credentials: {0}")]
    Credentials(String),

    /// Codec-level failure (framing, integrity, crypto)
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Common result type for LAN operations
pub type Result<T, E = SessionError> = std::result::Result<T, E>;
