//! Cryptography for the Midea LAN protocol
//!
//! The protocol stacks two cipher layers:
//! 1. AES-128-ECB under a fixed application key for appliance command
//!    bodies, guarded by an MD5 tag salted with [`TAG_SALT`]
//! 2. AES-256-CBC (zero IV, no padding) under the per-session `tcp_key`
//!    for outer v3 frames, signed with SHA-256
//!
//! The ECB layer predates the v3 transport and is kept by the firmware for
//! compatibility; both layers apply to every encrypted v3 exchange.

use crate::error::{ProtocolError, Result};
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use aes::{Aes128, Aes256};
use md5::{Digest, Md5};
use sha2::Sha256;
use tracing::warn;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Fixed application-layer AES-128 key, shared by all appliances
pub const APP_KEY: [u8; 16] = [
    0xc5, 0x75, 0x11, 0x5f, 0x1d, 0x7c, 0x43, 0x51, 0x98, 0x87, 0x6a, 0x64, 0x34, 0x11, 0x7a, 0x86,
];

/// Salt appended to packet data before the MD5 trailer is computed
pub const TAG_SALT: [u8; 32] = [
    0xa3, 0x24, 0xac, 0x3e, 0x19, 0x8a, 0x10, 0x52, 0x76, 0xbc, 0xec, 0x8a, 0x4e, 0xc9, 0xa7, 0x58,
    0x90, 0x97, 0x41, 0xe1, 0x14, 0x06, 0x7d, 0x70, 0x8b, 0x49, 0x16, 0x56, 0x0c, 0x55, 0x9e, 0x51,
];

/// 64-byte probe broadcast to UDP 6445 during discovery
pub const DISCOVERY_PROBE: [u8; 64] = [
    0x5a, 0x5a, 0x01, 0x11, 0x48, 0x00, 0x92, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7f, 0x75, 0xbd, 0x6b, 0x3e, 0x4f, 0x8b, 0x76,
    0x2e, 0x84, 0x9c, 0x6e, 0x57, 0x8d, 0x65, 0x90, 0x03, 0x6e, 0x9d, 0x43, 0x42, 0xa5, 0x0f, 0x1f,
];

/// Encrypt data with AES-128-ECB under [`APP_KEY`], padding with PKCS#7
pub fn encrypt_ecb(data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(&APP_KEY));

    let padding_len = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
    let mut padded = data.to_vec();
    padded.extend(vec![padding_len as u8; padding_len]);

    for chunk in padded.chunks_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }

    padded
}

/// Decrypt AES-128-ECB data under [`APP_KEY`] and strip PKCS#7 padding
///
/// The padding is validated strictly: a final byte outside `1..=16` or any
/// pad byte that differs from it is an integrity error, never returned as-is.
pub fn decrypt_ecb(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || !data.len().is_multiple_of(BLOCK_SIZE) {
        return Err(ProtocolError::Crypto(format!(
            "invalid ECB data length: {} (must be a non-zero multiple of {})",
            data.len(),
            BLOCK_SIZE
        )));
    }

    let cipher = Aes128::new(GenericArray::from_slice(&APP_KEY));

    let mut decrypted = data.to_vec();
    for chunk in decrypted.chunks_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }

    let padding_len = *decrypted.last().unwrap_or(&0) as usize;
    if padding_len == 0 || padding_len > BLOCK_SIZE {
        warn!(padding_len, "ECB padding byte out of range");
        return Err(ProtocolError::Integrity(format!(
            "invalid PKCS#7 padding byte: {padding_len}"
        )));
    }
    let body_len = decrypted.len() - padding_len;
    if decrypted[body_len..].iter().any(|&b| b as usize != padding_len) {
        warn!(padding_len, "ECB padding bytes inconsistent");
        return Err(ProtocolError::Integrity(
            "inconsistent PKCS#7 padding".to_string(),
        ));
    }

    decrypted.truncate(body_len);
    Ok(decrypted)
}

/// Encrypt data with AES-256-CBC (zero IV, no padding)
///
/// The transport guarantees block-aligned input; anything else is a caller
/// bug surfaced as an error rather than silently padded.
pub fn encrypt_cbc(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if !data.len().is_multiple_of(BLOCK_SIZE) {
        return Err(ProtocolError::Crypto(format!(
            "CBC plaintext length {} is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }

    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut out = Vec::with_capacity(data.len());
    let mut iv = [0u8; BLOCK_SIZE];
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        for (b, v) in block.iter_mut().zip(iv.iter()) {
            *b ^= v;
        }
        cipher.encrypt_block(&mut block);
        out.extend_from_slice(&block);
        iv.copy_from_slice(&block);
    }

    Ok(out)
}

/// Decrypt AES-256-CBC data (zero IV, no padding)
pub fn decrypt_cbc(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if !data.len().is_multiple_of(BLOCK_SIZE) {
        return Err(ProtocolError::Crypto(format!(
            "CBC ciphertext length {} is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }

    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut out = Vec::with_capacity(data.len());
    let mut iv = [0u8; BLOCK_SIZE];
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for (b, v) in block.iter_mut().zip(iv.iter()) {
            *b ^= v;
        }
        out.extend_from_slice(&block);
        iv.copy_from_slice(chunk);
    }

    Ok(out)
}

/// MD5 tag over `data` followed by [`TAG_SALT`]
pub fn md5_tag(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.update(TAG_SALT);
    hasher.finalize().into()
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// 8-bit complement checksum: `(~sum + 1) & 0xFF`
pub fn checksum8(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Byte-wise XOR of two equal-length buffers
pub fn buffer_xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecb_roundtrip() {
        let plaintext = b"Hello, Midea AC LAN!";

        let encrypted = encrypt_ecb(plaintext);
        assert_eq!(encrypted.len(), 32);

        let decrypted = decrypt_ecb(&encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_ecb_block_sizes() {
        for size in [1usize, 15, 16, 17, 31, 32, 100] {
            let plaintext: Vec<u8> = (0..size).map(|i| i as u8).collect();

            let encrypted = encrypt_ecb(&plaintext);
            assert_eq!(encrypted.len() % BLOCK_SIZE, 0);

            let decrypted = decrypt_ecb(&encrypted).unwrap();
            assert_eq!(decrypted, plaintext, "failed for size {size}");
        }
    }

    #[test]
    fn test_ecb_rejects_invalid_padding() {
        // A block-aligned plaintext gains a full pad block; dropping it
        // leaves ciphertext whose final decrypted byte is not a valid pad
        let mut plaintext = [0x41u8; 16];
        plaintext[15] = 0x00;

        let encrypted = encrypt_ecb(&plaintext);
        assert_eq!(encrypted.len(), 32);

        assert!(matches!(
            decrypt_ecb(&encrypted[..16]),
            Err(ProtocolError::Integrity(_))
        ));
    }

    #[test]
    fn test_ecb_rejects_inconsistent_padding() {
        // Final byte claims two pad bytes but the byte before it differs
        let mut plaintext = [0x41u8; 16];
        plaintext[14] = 0x07;
        plaintext[15] = 0x02;

        let encrypted = encrypt_ecb(&plaintext);

        assert!(matches!(
            decrypt_ecb(&encrypted[..16]),
            Err(ProtocolError::Integrity(_))
        ));
    }

    #[test]
    fn test_cbc_roundtrip() {
        let key = [0x42u8; 32];
        let plaintext = [0xA5u8; 48];

        let encrypted = encrypt_cbc(&plaintext, &key).unwrap();
        assert_eq!(encrypted.len(), 48);
        assert_ne!(encrypted[..16], encrypted[16..32]);

        let decrypted = decrypt_cbc(&encrypted, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_cbc_rejects_unaligned_input() {
        let key = [0u8; 32];
        assert!(matches!(
            encrypt_cbc(&[0u8; 15], &key),
            Err(ProtocolError::Crypto(_))
        ));
        assert!(matches!(
            decrypt_cbc(&[0u8; 17], &key),
            Err(ProtocolError::Crypto(_))
        ));
    }

    #[test]
    fn test_md5_tag_vector() {
        let tag = md5_tag(b"hello");
        assert_eq!(hex::encode(tag), "0b4ed1009360641eb6bd861965f36f4a");
    }

    #[test]
    fn test_checksum8_vector() {
        assert_eq!(checksum8(&[0x01, 0x02, 0x03, 0x04, 0x05]), 0xF1);
    }

    #[test]
    fn test_checksum8_zero_sum() {
        assert_eq!(checksum8(&[]), 0x00);
        assert_eq!(checksum8(&[0xFF, 0x01]), 0x00);
    }

    #[test]
    fn test_buffer_xor() {
        let a = [0xFF, 0x0F, 0xAA];
        let b = [0x0F, 0xFF, 0xAA];
        assert_eq!(buffer_xor(&a, &b), vec![0xF0, 0xF0, 0x00]);
    }

    #[test]
    fn test_discovery_probe_shape() {
        assert_eq!(DISCOVERY_PROBE[0..2], [0x5a, 0x5a]);
        assert_eq!(DISCOVERY_PROBE.len(), 64);
        assert!(DISCOVERY_PROBE[8..40].iter().all(|&b| b == 0));
    }
}
