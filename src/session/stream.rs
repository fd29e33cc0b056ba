//! Streaming cipher for file content.
//!
//! File bytes are encrypted with ChaCha20 under the message key and
//! authenticated with HMAC-SHA256 over the ciphertext. The 32-byte tag is
//! written after the last chunk; the decipher holds back the trailing bytes
//! of the stream until `finalize` so the tag never reaches the output.

use super::ratchet::{Key, MessageKeys};
use crate::utils::{CryptoError, Result};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of the authentication tag closing every stream
pub const TAG_LEN: usize = 32;

/// Nonce bytes for the stream keystream, disjoint from the content AEAD nonce
const STREAM_NONCE: std::ops::Range<usize> = 12..24;

fn stream_parts(keys: &MessageKeys) -> Result<(ChaCha20, HmacSha256)> {
    let cipher = ChaCha20::new_from_slices(&keys.encrypt_key, &keys.iv[STREAM_NONCE]).map_err(
        |_| CryptoError::InvalidKey {
            reason: "Invalid stream cipher key or nonce".to_string(),
        },
    )?;
    let mac = mac_for(&keys.mac_key)?;
    Ok((cipher, mac))
}

fn mac_for(key: &Key) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| {
        CryptoError::InvalidKey {
            reason: "Invalid stream MAC key".to_string(),
        }
        .into()
    })
}

/// Encrypting half of a file stream
pub struct ContentCipher {
    cipher: ChaCha20,
    mac: HmacSha256,
}

impl ContentCipher {
    pub(crate) fn new(keys: &MessageKeys) -> Result<Self> {
        let (cipher, mac) = stream_parts(keys)?;
        Ok(Self { cipher, mac })
    }

    /// Encrypt a chunk in place
    pub fn update(&mut self, chunk: &mut [u8]) -> Result<()> {
        self.cipher
            .try_apply_keystream(chunk)
            .map_err(|_| CryptoError::Encryption {
                reason: "Stream keystream exhausted".to_string(),
            })?;
        self.mac.update(chunk);
        Ok(())
    }

    /// Tag to append after the last chunk
    pub fn finalize(self) -> [u8; TAG_LEN] {
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&self.mac.finalize().into_bytes());
        tag
    }
}

/// Decrypting half of a file stream
pub struct ContentDecipher {
    cipher: ChaCha20,
    mac: HmacSha256,
    pending: Vec<u8>,
}

impl ContentDecipher {
    pub(crate) fn new(keys: &MessageKeys) -> Result<Self> {
        let (cipher, mac) = stream_parts(keys)?;
        Ok(Self {
            cipher,
            mac,
            pending: Vec::with_capacity(TAG_LEN),
        })
    }

    /// Feed received bytes, returning whatever plaintext is safe to release
    pub fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(input);
        if self.pending.len() <= TAG_LEN {
            return Ok(Vec::new());
        }

        let ready = self.pending.len() - TAG_LEN;
        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        self.mac.update(&out);
        self.cipher
            .try_apply_keystream(&mut out)
            .map_err(|_| CryptoError::Decryption {
                reason: "Stream keystream exhausted".to_string(),
            })?;
        Ok(out)
    }

    /// Check the trailing tag once the stream has ended
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decryption` if the stream was truncated or altered
    pub fn finalize(self) -> Result<()> {
        if self.pending.len() != TAG_LEN {
            return Err(CryptoError::Decryption {
                reason: "Stream truncated before authentication tag".to_string(),
            }
            .into());
        }

        self.mac.verify_slice(&self.pending).map_err(|_| {
            CryptoError::Decryption {
                reason: "Stream authentication failed".to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> MessageKeys {
        MessageKeys {
            encrypt_key: [seed; 32],
            mac_key: [seed.wrapping_add(1); 32],
            iv: [seed.wrapping_add(2); 32],
        }
    }

    fn encrypt(data: &[u8], chunk: usize) -> Vec<u8> {
        let mut cipher = ContentCipher::new(&keys(1)).unwrap();
        let mut out = Vec::new();
        for piece in data.chunks(chunk) {
            let mut buf = piece.to_vec();
            cipher.update(&mut buf).unwrap();
            out.extend_from_slice(&buf);
        }
        out.extend_from_slice(&cipher.finalize());
        out
    }

    #[test]
    fn test_stream_round_trip_across_uneven_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let sealed = encrypt(&data, 4096);
        assert_eq!(sealed.len(), data.len() + TAG_LEN);

        let mut decipher = ContentDecipher::new(&keys(1)).unwrap();
        let mut plain = Vec::new();
        for piece in sealed.chunks(777) {
            plain.extend(decipher.update(piece).unwrap());
        }
        decipher.finalize().unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn test_tampered_stream_fails() {
        let mut sealed = encrypt(b"some file contents", 5);
        sealed[3] ^= 0x80;

        let mut decipher = ContentDecipher::new(&keys(1)).unwrap();
        decipher.update(&sealed).unwrap();
        assert!(decipher.finalize().is_err());
    }

    #[test]
    fn test_truncated_stream_fails() {
        let sealed = encrypt(b"abc", 3);
        let mut decipher = ContentDecipher::new(&keys(1)).unwrap();
        decipher.update(&sealed[..TAG_LEN]).unwrap();
        assert!(decipher.finalize().is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(b"secret", 6);
        let mut decipher = ContentDecipher::new(&keys(9)).unwrap();
        decipher.update(&sealed).unwrap();
        assert!(decipher.finalize().is_err());
    }

    #[test]
    fn test_empty_stream() {
        let sealed = encrypt(b"", 1);
        let mut decipher = ContentDecipher::new(&keys(1)).unwrap();
        assert!(decipher.update(&sealed).unwrap().is_empty());
        decipher.finalize().unwrap();
    }
}
