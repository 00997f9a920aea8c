//! Protocol error kinds
//!
//! The session engine reacts differently per kind (reconnect vs terminate),
//! so codec failures are typed rather than stringly wrapped.

use thiserror::Error;

/// Errors produced by the codec and crypto layers
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Bad magic bytes or an impossible length field
    #[error("framing error: {0}")]
    Framing(String),

    /// Signature, MD5 tag, checksum, or PKCS#7 padding mismatch
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Handshake response failed verification
    #[error("authentication error: {0}")]
    Auth(String),

    /// A cipher precondition was violated (e.g. CBC input not block-aligned)
    #[error("crypto error: {0}")]
    Crypto(String),

    /// An encrypted frame was requested before the handshake established a key
    #[error("no session key established")]
    MissingSessionKey,
}

/// Common result type for protocol operations
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
