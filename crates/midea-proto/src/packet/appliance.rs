//! Appliance messages
//!
//! The application payload inside every inner packet:
//!
//! ```text
//! ┌──────┬────────┬──────┬──────────────┬───────┬──────┬──────────┐
//! │ 0xAA │ length │ type │ 5 x reserved │ proto │ msg  │ body ‖ ck │
//! └──────┴────────┴──────┴──────────────┴───────┴──────┴──────────┘
//! ```
//!
//! `length` counts every byte after the leading `0xAA`; the trailing
//! checksum is the 8-bit complement sum over the same range (checksum byte
//! excluded).

use crate::crypto::checksum8;
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Header size in bytes, leading `0xAA` included
pub const HEADER_SIZE: usize = 10;

/// Smallest valid message: header plus checksum
pub const MIN_MESSAGE_SIZE: usize = 11;

/// Known appliance message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Apply a new appliance state
    Set = 0x02,
    /// Request current appliance state
    Query = 0x03,
    /// Unsolicited state broadcast
    Notify1 = 0x04,
    /// Unsolicited state broadcast (secondary)
    Notify2 = 0x05,
    /// Appliance-reported fault
    Exception = 0x06,
    /// Appliance-reported fault (secondary)
    Exception2 = 0x0A,
    /// Capability and protocol-version probe
    QueryAppliance = 0xA0,
}

impl MessageType {
    /// Convert a raw header byte to a known message type
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::Set),
            0x03 => Some(Self::Query),
            0x04 => Some(Self::Notify1),
            0x05 => Some(Self::Notify2),
            0x06 => Some(Self::Exception),
            0x0A => Some(Self::Exception2),
            0xA0 => Some(Self::QueryAppliance),
            _ => None,
        }
    }
}

/// One appliance request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceMessage {
    /// Product category tag (0xAC, 0xA1, 0xFA, 0xE2, ...)
    pub appliance_type: u8,

    /// Appliance protocol version (header byte 8)
    pub protocol_version: u8,

    /// Raw message type byte; responses may carry values outside
    /// [`MessageType`]
    pub message_type: u8,

    /// Opaque appliance-specific payload
    pub body: Vec<u8>,
}

impl ApplianceMessage {
    /// Create a request message
    pub fn new(appliance_type: u8, message_type: MessageType, body: Vec<u8>) -> Self {
        Self {
            appliance_type,
            protocol_version: 0,
            message_type: message_type as u8,
            body,
        }
    }

    /// The protocol-version probe: a `0xA0` request with a 19-byte zero body
    ///
    /// The reply's header byte 8 reveals the appliance protocol version.
    pub fn query_appliance(appliance_type: u8) -> Self {
        Self::new(appliance_type, MessageType::QueryAppliance, vec![0u8; 19])
    }

    /// The known message type, if the raw byte maps to one
    pub fn known_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.message_type)
    }

    /// Serialize header, body, and trailing checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_MESSAGE_SIZE + self.body.len());

        buf.push(0xAA);
        buf.push((HEADER_SIZE + self.body.len()) as u8);
        buf.push(self.appliance_type);
        buf.extend_from_slice(&[0x00; 5]);
        buf.push(self.protocol_version);
        buf.push(self.message_type);
        buf.extend_from_slice(&self.body);
        buf.push(checksum8(&buf[1..]));

        buf
    }

    /// Parse and verify a serialized message
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_MESSAGE_SIZE {
            return Err(ProtocolError::Framing(format!(
                "appliance message too short: {} bytes (need at least {MIN_MESSAGE_SIZE})",
                data.len()
            )));
        }
        if data[0] != 0xAA {
            return Err(ProtocolError::Framing(format!(
                "invalid appliance message marker: 0x{:02x}",
                data[0]
            )));
        }

        let end = data.len() - 1;
        let expected = checksum8(&data[1..end]);
        if expected != data[end] {
            return Err(ProtocolError::Integrity(format!(
                "appliance checksum mismatch: computed 0x{expected:02x}, found 0x{:02x}",
                data[end]
            )));
        }

        Ok(Self {
            appliance_type: data[2],
            protocol_version: data[8],
            message_type: data[9],
            body: data[HEADER_SIZE..end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_shape() {
        let msg = ApplianceMessage::new(0xAC, MessageType::Query, vec![0x01, 0x02]);
        let bytes = msg.encode();

        assert_eq!(bytes[0], 0xAA);
        assert_eq!(bytes[1] as usize, bytes.len() - 1);
        assert_eq!(bytes[2], 0xAC);
        assert_eq!(bytes[9], 0x03);
        assert_eq!(*bytes.last().unwrap(), checksum8(&bytes[1..bytes.len() - 1]));
    }

    #[test]
    fn test_roundtrip() {
        let msg = ApplianceMessage {
            appliance_type: 0xA1,
            protocol_version: 3,
            message_type: MessageType::Set as u8,
            body: vec![0x40, 0x41, 0x42],
        };

        let parsed = ApplianceMessage::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_query_appliance_probe() {
        let msg = ApplianceMessage::query_appliance(0xFA);

        assert_eq!(msg.message_type, 0xA0);
        assert_eq!(msg.body, vec![0u8; 19]);
        assert_eq!(msg.known_type(), Some(MessageType::QueryAppliance));
        assert_eq!(msg.encode().len(), MIN_MESSAGE_SIZE + 19);
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let mut bytes = ApplianceMessage::new(0xAC, MessageType::Query, vec![0x01]).encode();
        bytes[10] ^= 0xFF;

        assert!(matches!(
            ApplianceMessage::parse(&bytes),
            Err(ProtocolError::Integrity(_))
        ));
    }

    #[test]
    fn test_short_message_rejected() {
        assert!(matches!(
            ApplianceMessage::parse(&[0xAA; 10]),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn test_unknown_type_preserved() {
        let raw = ApplianceMessage {
            appliance_type: 0xE2,
            protocol_version: 2,
            message_type: 0xB5,
            body: vec![],
        };

        let parsed = ApplianceMessage::parse(&raw.encode()).unwrap();
        assert_eq!(parsed.message_type, 0xB5);
        assert_eq!(parsed.known_type(), None);
    }
}
