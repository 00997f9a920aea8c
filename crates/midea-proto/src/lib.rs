//! Midea LAN Protocol Core
//!
//! Wire formats and cryptography shared by every appliance in the Midea
//! local-network family:
//! - Crypto primitives (fixed-key AES-ECB, session-key AES-CBC, MD5 salt tag)
//! - Inner application packets (`5A 5A` envelope with MD5 trailer)
//! - Appliance messages (`AA` header with 8-bit complement checksum)
//! - Outer v3 transport frames (`83 70`, sequence-counted, SHA-256 signed)
//!
//! This crate is I/O-free; the network engine lives in `midea-lan`.

pub mod crypto;
pub mod error;
pub mod packet;
pub mod protocol;

pub use error::{ProtocolError, Result};
pub use packet::InnerPacket;
pub use packet::appliance::{ApplianceMessage, MessageType};
pub use protocol::{Frame, FrameType, TransportCodec};
