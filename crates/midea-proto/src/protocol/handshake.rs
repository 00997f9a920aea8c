//! Session-key derivation
//!
//! The v3 handshake exchanges the 64-byte device token for a 32-byte
//! `tcp_key`:
//! 1. Client sends the token as a `HandshakeRequest` frame
//! 2. Device replies with 64 bytes: `payload[0..32] ‖ sign[32..64]`
//! 3. `plain = AES-CBC-decrypt(payload, key)`; `SHA256(plain)` must equal
//!    `sign`
//! 4. `tcp_key = plain XOR key`

use crate::crypto;
use crate::error::{ProtocolError, Result};

/// Expected handshake response body size
pub const RESPONSE_SIZE: usize = 64;

/// Derive the session key from a handshake response body
///
/// `response` is the 64-byte frame body (outer header and sequence counter
/// already stripped); `key` is the 32-byte device key from the credentials.
pub fn derive_tcp_key(response: &[u8], key: &[u8; 32]) -> Result<[u8; 32]> {
    if response.len() != RESPONSE_SIZE {
        return Err(ProtocolError::Auth(format!(
            "handshake response is {} bytes, expected {RESPONSE_SIZE}",
            response.len()
        )));
    }

    let (payload, sign) = response.split_at(32);
    let plain = crypto::decrypt_cbc(payload, key)?;
    if crypto::sha256(&plain) != sign {
        return Err(ProtocolError::Auth(
            "handshake signature mismatch".to_string(),
        ));
    }

    let tcp_key = crypto::buffer_xor(&plain, key);
    tcp_key
        .try_into()
        .map_err(|_| ProtocolError::Auth("derived key has wrong length".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    /// Build a device-side handshake response for a chosen session secret
    fn device_response(secret: &[u8; 32], key: &[u8; 32]) -> Vec<u8> {
        let mut response = crypto::encrypt_cbc(secret, key).unwrap();
        response.extend_from_slice(&crypto::sha256(secret));
        response
    }

    #[test]
    fn test_derive_matches_device_secret() {
        let key = [0x17u8; 32];
        let secret = [0x5Au8; 32];

        let derived = derive_tcp_key(&device_response(&secret, &key), &key).unwrap();
        assert_eq!(derived.to_vec(), crypto::buffer_xor(&secret, &key));
    }

    #[test]
    fn test_sign_mismatch_rejected() {
        let key = [0x17u8; 32];
        let secret = [0x5Au8; 32];

        let mut response = device_response(&secret, &key);
        response[40] ^= 0x01;

        assert!(matches!(
            derive_tcp_key(&response, &key),
            Err(ProtocolError::Auth(_))
        ));
    }

    #[test]
    fn test_short_response_rejected() {
        let key = [0u8; 32];
        assert!(matches!(
            derive_tcp_key(&[0u8; 63], &key),
            Err(ProtocolError::Auth(_))
        ));
    }
}
