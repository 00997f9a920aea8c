//! Inner application packets
//!
//! Every command and status exchange travels inside a `5A 5A` envelope:
//!
//! ```text
//! Offset | Size | Field
//! -------|------|--------------------------------------
//! 0x00   | 2    | magic 0x5A 0x5A
//! 0x02   | 2    | version marker (0x01 0x11, 0x01 0x10 for plain)
//! 0x04   | 2    | total length (u16 LE, includes trailer)
//! 0x06   | 2    | flags (0x0020, 0x7B00 for plain)
//! 0x08   | 4    | message id
//! 0x0C   | 8    | timestamp, reversed two-digit pairs
//! 0x14   | 8    | device id (u64 LE)
//! 0x1C   | 12   | reserved
//! 0x28   | N    | body (AES-ECB under the app key, or clear)
//! ...    | 16   | MD5 salt tag over everything above
//! ```

pub mod appliance;

use crate::crypto;
use crate::error::{ProtocolError, Result};
use bytes::BufMut;
use chrono::{DateTime, Local, Timelike};

/// Magic bytes opening every inner packet
pub const PACKET_MAGIC: [u8; 2] = [0x5A, 0x5A];

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 40;

/// MD5 trailer size in bytes
pub const TAG_SIZE: usize = 16;

/// Smallest packet that can carry the header and trailer
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + TAG_SIZE;

/// Inner application packet
///
/// `body` always holds the clear application bytes; encryption happens at
/// encode time and decryption at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerPacket {
    /// Device the packet is addressed to (or originated from)
    pub device_id: u64,

    /// Clear application payload (usually an appliance message)
    pub body: Vec<u8>,

    /// Whether the body travels AES-ECB encrypted under the app key
    pub encrypted: bool,
}

impl InnerPacket {
    /// Create a standard encrypted packet
    pub fn new(device_id: u64, body: Vec<u8>) -> Self {
        Self {
            device_id,
            body,
            encrypted: true,
        }
    }

    /// Create a plain packet (handshake variant: version 0x10, flags 0x7B)
    pub fn plain(device_id: u64, body: Vec<u8>) -> Self {
        Self {
            device_id,
            body,
            encrypted: false,
        }
    }

    /// The keep-alive packet: plain variant carrying a single zero byte
    pub fn heartbeat(device_id: u64) -> Self {
        Self::plain(device_id, vec![0x00])
    }

    /// Serialize the packet, stamping it with the current local time
    pub fn encode(&self) -> Vec<u8> {
        self.encode_at(Local::now())
    }

    fn encode_at(&self, now: DateTime<Local>) -> Vec<u8> {
        let body = if self.encrypted {
            crypto::encrypt_ecb(&self.body)
        } else {
            self.body.clone()
        };

        let total = HEADER_SIZE + body.len() + TAG_SIZE;
        let mut buf = Vec::with_capacity(total);

        buf.put_slice(&PACKET_MAGIC);
        buf.put_u8(0x01);
        buf.put_u8(if self.encrypted { 0x11 } else { 0x10 });
        buf.put_u16_le(total as u16);
        buf.put_u8(if self.encrypted { 0x20 } else { 0x7B });
        buf.put_u8(0x00);
        buf.put_u32_le(0); // message id
        buf.put_slice(&packet_time(now));
        buf.put_u64_le(self.device_id);
        buf.put_slice(&[0u8; 12]);
        buf.put_slice(&body);

        let tag = crypto::md5_tag(&buf);
        buf.put_slice(&tag);

        buf
    }

    /// Parse and verify a serialized packet
    ///
    /// Checks the magic and the MD5 trailer, then decrypts the body slice
    /// for the encrypted variant.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(ProtocolError::Framing(format!(
                "inner packet too short: {} bytes (need at least {MIN_PACKET_SIZE})",
                data.len()
            )));
        }
        if data[0..2] != PACKET_MAGIC {
            return Err(ProtocolError::Framing(format!(
                "invalid inner packet magic: {:02x} {:02x}",
                data[0], data[1]
            )));
        }

        let total = u16::from_le_bytes([data[4], data[5]]) as usize;
        if total < MIN_PACKET_SIZE || total > data.len() {
            return Err(ProtocolError::Framing(format!(
                "impossible inner packet length: {total} (buffer holds {})",
                data.len()
            )));
        }

        let (payload, tag) = data[..total].split_at(total - TAG_SIZE);
        if crypto::md5_tag(payload) != tag {
            return Err(ProtocolError::Integrity(
                "inner packet MD5 tag mismatch".to_string(),
            ));
        }

        let device_id = u64::from_le_bytes(
            data[20..28]
                .try_into()
                .map_err(|_| ProtocolError::Framing("truncated device id".to_string()))?,
        );

        let encrypted = data[3] == 0x11;
        let body_slice = &payload[HEADER_SIZE..];
        let body = if encrypted && !body_slice.is_empty() {
            crypto::decrypt_ecb(body_slice)?
        } else {
            body_slice.to_vec()
        };

        Ok(Self {
            device_id,
            body,
            encrypted,
        })
    }

    /// Total serialized length claimed by a packet header, if enough bytes
    /// are present to read it
    pub fn peek_length(data: &[u8]) -> Option<usize> {
        if data.len() < 6 {
            return None;
        }
        Some(u16::from_le_bytes([data[4], data[5]]) as usize)
    }
}

/// Encode a timestamp as eight two-digit decimal bytes in reverse order
///
/// `YYYYMMDDHHmmssSS` (SS = centiseconds) split into pairs, last pair first.
fn packet_time(now: DateTime<Local>) -> [u8; 8] {
    let centis = now.nanosecond() / 10_000_000;
    let stamp = format!("{}{:02}", now.format("%Y%m%d%H%M%S"), centis.min(99));

    let mut out = [0u8; 8];
    for (i, pair) in stamp.as_bytes().chunks(2).enumerate().take(8) {
        out[7 - i] = (pair[0] - b'0') * 10 + (pair[1] - b'0');
    }
    out
}
