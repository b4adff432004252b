//! AES-256-GCM session with per-direction sequence counters.
//!
//! The nonce for frame `n` in a direction is that direction's HKDF-derived
//! base nonce with the trailing 8 bytes XORed by the big-endian counter:
//!
//! ```text
//! nonce(n) = base XOR (00 00 00 00 || be_u64(n))
//! ```
//!
//! Counters advance by exactly one per successful operation, so both sides
//! stay in lockstep; a dropped or duplicated frame shows up as an
//! authentication failure on the very next decrypt rather than as silent
//! corruption. The associated data is the one-byte message-type tag, which
//! binds every ciphertext to its declared message kind.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use super::handshake::DirectionalKeys;
use crate::core::{CryptoError, AEAD_NONCE_SIZE, AEAD_TAG_SIZE};

/// Authenticated-encryption state for one secured connection.
///
/// Key material is owned exclusively and zeroized when the session drops.
pub struct AeadSession {
    keys: DirectionalKeys,
    tx_seq: u64,
    rx_seq: u64,
}

impl AeadSession {
    /// Build a session from freshly derived directional keys.
    pub fn new(keys: DirectionalKeys) -> Self {
        Self {
            keys,
            tx_seq: 0,
            rx_seq: 0,
        }
    }

    /// Next sequence number that will be used for sending.
    pub fn tx_seq(&self) -> u64 {
        self.tx_seq
    }

    /// Next sequence number expected on receive.
    pub fn rx_seq(&self) -> u64 {
        self.rx_seq
    }

    /// Encrypt a frame payload. Returns `ciphertext || tag`.
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.tx_seq == u64::MAX {
            return Err(CryptoError::SequenceExhausted);
        }

        let nonce = sequence_nonce(self.keys.tx_base_nonce(), self.tx_seq);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.keys.tx_key()));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        self.tx_seq += 1;
        Ok(ciphertext)
    }

    /// Verify and decrypt a received `ciphertext || tag`.
    ///
    /// A failed tag check is fatal for the session; the message is never
    /// delivered and the counter does not advance.
    pub fn decrypt(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < AEAD_TAG_SIZE {
            return Err(CryptoError::AuthenticationFailed);
        }
        if self.rx_seq == u64::MAX {
            return Err(CryptoError::SequenceExhausted);
        }

        let nonce = sequence_nonce(self.keys.rx_base_nonce(), self.rx_seq);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.keys.rx_key()));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        self.rx_seq += 1;
        Ok(plaintext)
    }
}

/// XOR the big-endian counter into the trailing 8 bytes of the base nonce.
fn sequence_nonce(base: &[u8; AEAD_NONCE_SIZE], seq: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = *base;
    let counter = seq.to_be_bytes();
    for (slot, byte) in nonce[AEAD_NONCE_SIZE - 8..].iter_mut().zip(counter) {
        *slot ^= byte;
    }
    nonce
}
