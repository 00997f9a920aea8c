//! v3 frame codec
//!
//! Frame layout:
//!
//! ```text
//! ┌───────────┬──────────────┬──────┬─────────────────┬─────────────────┐
//! │ 0x83 0x70 │ size (u16 BE)│ 0x20 │ pad<<4 | type   │ payload ‖ sign  │
//! └───────────┴──────────────┴──────┴─────────────────┴─────────────────┘
//! ```
//!
//! `size + 8` is the total frame length on the wire. The payload always
//! opens with a big-endian sequence counter; encrypted frames are AES-CBC
//! under the session `tcp_key` with a trailing SHA-256 signature over
//! `header ‖ plaintext`.

use crate::crypto::{self, BLOCK_SIZE};
use crate::error::{ProtocolError, Result};
use crate::protocol::{COUNTER_SIZE, FRAME_HEADER_SIZE, FRAME_MAGIC, SIGN_SIZE, handshake};
use bytes::BufMut;
use rand::Rng;
use tracing::{debug, warn};

/// Frame type nibble (low half of header byte 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client token offer
    HandshakeRequest = 0x0,
    /// Device key material reply
    HandshakeResponse = 0x1,
    /// Device-to-client encrypted frame
    EncryptedResponse = 0x3,
    /// Client-to-device encrypted frame
    EncryptedRequest = 0x6,
}

impl FrameType {
    /// Whether frames of this type are CBC-encrypted and signed
    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::EncryptedResponse | Self::EncryptedRequest)
    }
}

fn nibble_is_encrypted(nibble: u8) -> bool {
    nibble == FrameType::EncryptedResponse as u8 || nibble == FrameType::EncryptedRequest as u8
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Frame body with the sequence counter stripped
    Message(Vec<u8>),

    /// The appliance rejected the session; the socket must be dropped
    Error,
}

/// Stateful frame codec for one session
///
/// Owns the session key and both sequence counters. One codec instance is
/// bound to one TCP connection; reconnecting replaces it (or re-runs
/// [`TransportCodec::authenticate`], which resets the counters).
#[derive(Debug, Default)]
pub struct TransportCodec {
    tcp_key: Option<[u8; 32]>,
    request_counter: u16,
    response_counter: u16,
}

impl TransportCodec {
    /// Create a codec with no session key (pre-handshake)
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive and install the session key from a handshake response body,
    /// resetting both counters
    pub fn authenticate(&mut self, response: &[u8], key: &[u8; 32]) -> Result<()> {
        let tcp_key = handshake::derive_tcp_key(response, key)?;
        debug!("session key established");
        self.tcp_key = Some(tcp_key);
        self.request_counter = 0;
        self.response_counter = 0;
        Ok(())
    }

    /// Install a known session key directly (device side, tests)
    pub fn set_tcp_key(&mut self, key: [u8; 32]) {
        self.tcp_key = Some(key);
        self.request_counter = 0;
        self.response_counter = 0;
    }

    /// Forget the session key (socket teardown)
    pub fn clear_tcp_key(&mut self) {
        self.tcp_key = None;
    }

    /// Whether the handshake has completed on this connection
    pub fn has_tcp_key(&self) -> bool {
        self.tcp_key.is_some()
    }

    /// Sequence number the next outbound frame will carry
    pub fn request_counter(&self) -> u16 {
        self.request_counter
    }

    /// Sequence number observed on the most recent inbound frame
    pub fn response_counter(&self) -> u16 {
        self.response_counter
    }

    /// Encode one frame, consuming one request counter value
    pub fn encode(&mut self, payload: &[u8], frame_type: FrameType) -> Result<Vec<u8>> {
        let mut data = payload.to_vec();
        let mut padding = 0u8;

        if frame_type.is_encrypted() {
            let overhang = (data.len() + COUNTER_SIZE) % BLOCK_SIZE;
            if overhang != 0 {
                padding = (BLOCK_SIZE - overhang) as u8;
                let mut fill = vec![0u8; padding as usize];
                rand::thread_rng().fill(&mut fill[..]);
                data.extend_from_slice(&fill);
            }
        }

        let mut size = data.len();
        if frame_type.is_encrypted() {
            size += SIGN_SIZE;
        }

        let mut header = Vec::with_capacity(FRAME_HEADER_SIZE);
        header.put_slice(&FRAME_MAGIC);
        header.put_u16(size as u16);
        header.put_u8(0x20);
        header.put_u8(padding << 4 | frame_type as u8);

        let mut body = Vec::with_capacity(COUNTER_SIZE + data.len());
        body.put_u16(self.request_counter);
        body.put_slice(&data);
        self.request_counter = self.request_counter.wrapping_add(1);

        let mut frame = header.clone();
        if frame_type.is_encrypted() {
            let key = self.tcp_key.ok_or(ProtocolError::MissingSessionKey)?;
            let mut signed = header;
            signed.extend_from_slice(&body);
            let sign = crypto::sha256(&signed);

            frame.extend_from_slice(&crypto::encrypt_cbc(&body, &key)?);
            frame.extend_from_slice(&sign);
        } else {
            frame.extend_from_slice(&body);
        }

        Ok(frame)
    }

    /// Drain every complete frame from `buffer`
    ///
    /// Partial trailing bytes stay in `buffer` for the next read. A bad
    /// magic or a failed signature is fatal for the connection and
    /// surfaces as an error; an appliance `ERROR` notice decodes as
    /// [`Frame::Error`] instead.
    pub fn decode(&mut self, buffer: &mut Vec<u8>) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();

        while buffer.len() >= FRAME_HEADER_SIZE {
            if buffer[0..2] != FRAME_MAGIC {
                return Err(ProtocolError::Framing(format!(
                    "invalid frame magic: {:02x} {:02x}",
                    buffer[0], buffer[1]
                )));
            }

            let total = u16::from_be_bytes([buffer[2], buffer[3]]) as usize + 8;
            if buffer.len() < total {
                // Incomplete frame; wait for more bytes
                break;
            }

            let packet: Vec<u8> = buffer.drain(..total).collect();
            let header = &packet[..FRAME_HEADER_SIZE];
            let padding = (packet[5] >> 4) as usize;
            let msg_type = packet[5] & 0x0F;
            let mut data = packet[FRAME_HEADER_SIZE..].to_vec();

            if nibble_is_encrypted(msg_type) {
                if data.len() < SIGN_SIZE + BLOCK_SIZE {
                    return Err(ProtocolError::Framing(format!(
                        "encrypted frame payload too short: {} bytes",
                        data.len()
                    )));
                }

                let sign = data.split_off(data.len() - SIGN_SIZE);
                let key = self.tcp_key.ok_or(ProtocolError::MissingSessionKey)?;
                data = crypto::decrypt_cbc(&data, &key)?;

                let mut signed = header.to_vec();
                signed.extend_from_slice(&data);
                if crypto::sha256(&signed) != sign[..] {
                    let trimmed = &data[..data.len().saturating_sub(padding)];
                    if trimmed == b"ERROR" {
                        warn!("appliance rejected the session");
                        frames.push(Frame::Error);
                        continue;
                    }
                    return Err(ProtocolError::Integrity(
                        "frame signature mismatch".to_string(),
                    ));
                }
            }

            if padding > 0 {
                if data.len() < padding + COUNTER_SIZE {
                    return Err(ProtocolError::Framing(format!(
                        "frame padding {padding} exceeds payload of {} bytes",
                        data.len()
                    )));
                }
                data.truncate(data.len() - padding);
            }

            if data.len() < COUNTER_SIZE {
                return Err(ProtocolError::Framing(
                    "frame too short for sequence counter".to_string(),
                ));
            }

            self.response_counter = u16::from_be_bytes([data[0], data[1]]);
            debug!(
                counter = self.response_counter,
                msg_type,
                len = data.len() - COUNTER_SIZE,
                "decoded frame"
            );
            frames.push(Frame::Message(data[COUNTER_SIZE..].to_vec()));
        }

        Ok(frames)
    }
}
