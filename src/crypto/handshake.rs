//! Ephemeral key exchange and the directional key schedule.
//!
//! Each endpoint generates a fresh P-256 keypair and a 32-byte salt per
//! connection. After the `KeyExchange` frames cross, both sides derive the
//! same material with HKDF-SHA256:
//!
//! ```text
//! Z             = ECDH(x-coordinate only)
//! combined_salt = client_salt || server_salt        (64 bytes)
//! key  c2s/s2c  = HKDF(Z, combined_salt, "local-p2p v1.1 key ...")   32 B
//! nonce c2s/s2c = HKDF(Z, combined_salt, "local-p2p v1.1 nonce ...") 12 B
//! sas           = HKDF(Z, combined_salt, "local-p2p v1.1 sas")        4 B
//! ```
//!
//! The server transmits on s2c and receives on c2s; the client is the
//! mirror image. Every intermediate buffer is zeroized before `derive`
//! returns, and the derived directional material zeroizes on drop.

use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::sas::Sas;
use crate::core::{
    CryptoError, AEAD_NONCE_SIZE, INFO_KEY_C2S, INFO_KEY_S2C, INFO_NONCE_C2S, INFO_NONCE_S2C,
    INFO_SAS, SALT_SIZE, SAS_SIZE, SESSION_KEY_SIZE,
};

/// Which side of the connection this endpoint plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The connecting side (client).
    Initiator,
    /// The accepting side (server).
    Responder,
}

impl Role {
    /// Whether this role takes the server slots of the key schedule.
    pub fn is_server(self) -> bool {
        matches!(self, Role::Responder)
    }
}

/// Directionally separated session material.
///
/// Owned buffers only; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DirectionalKeys {
    tx_key: [u8; SESSION_KEY_SIZE],
    rx_key: [u8; SESSION_KEY_SIZE],
    tx_base_nonce: [u8; AEAD_NONCE_SIZE],
    rx_base_nonce: [u8; AEAD_NONCE_SIZE],
}

impl DirectionalKeys {
    /// Key this endpoint encrypts with.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn tx_key(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.tx_key
    }

    /// Key this endpoint decrypts with.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn rx_key(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.rx_key
    }

    /// Base nonce for the transmit direction.
    pub fn tx_base_nonce(&self) -> &[u8; AEAD_NONCE_SIZE] {
        &self.tx_base_nonce
    }

    /// Base nonce for the receive direction.
    pub fn rx_base_nonce(&self) -> &[u8; AEAD_NONCE_SIZE] {
        &self.rx_base_nonce
    }
}

/// Per-connection ephemeral key material.
///
/// Created when the engine starts a handshake and consumed by [`derive`],
/// which can therefore run at most once per instance. The private scalar
/// zeroizes on drop.
///
/// [`derive`]: SessionCrypto::derive
pub struct SessionCrypto {
    secret: EphemeralSecret,
    public_key_der: Vec<u8>,
    salt: [u8; SALT_SIZE],
}

impl SessionCrypto {
    /// Generate a fresh keypair and salt.
    pub fn new() -> Result<Self, CryptoError> {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_key_der = secret
            .public_key()
            .to_public_key_der()
            .map_err(|_| CryptoError::KeyDerivationFailed)?
            .into_vec();

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);

        Ok(Self {
            secret,
            public_key_der,
            salt,
        })
    }

    /// Our public key as SubjectPublicKeyInfo DER, ready for the wire.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Our salt contribution to the key schedule.
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    /// Run the key schedule against the peer's public key and salt.
    ///
    /// Consumes the instance: the ephemeral secret is gone afterwards, so a
    /// second derivation is unrepresentable. Rejects any peer key that is
    /// not a valid P-256 SPKI document.
    pub fn derive(
        self,
        peer_spki: &[u8],
        peer_salt: &[u8; SALT_SIZE],
        is_server: bool,
    ) -> Result<(DirectionalKeys, Sas), CryptoError> {
        let peer_key =
            PublicKey::from_public_key_der(peer_spki).map_err(|_| CryptoError::CurveMismatch)?;

        // x-coordinate of the ECDH point; zeroized when `shared` drops.
        let shared = self.secret.diffie_hellman(&peer_key);

        // The client's salt goes first regardless of which side derives.
        let mut combined_salt = [0u8; 2 * SALT_SIZE];
        let (client_salt, server_salt): (&[u8; SALT_SIZE], &[u8; SALT_SIZE]) = if is_server {
            (peer_salt, &self.salt)
        } else {
            (&self.salt, peer_salt)
        };
        combined_salt[..SALT_SIZE].copy_from_slice(client_salt);
        combined_salt[SALT_SIZE..].copy_from_slice(server_salt);

        let hk = Hkdf::<Sha256>::new(Some(&combined_salt), shared.raw_secret_bytes());

        let mut key_c2s = [0u8; SESSION_KEY_SIZE];
        let mut key_s2c = [0u8; SESSION_KEY_SIZE];
        let mut nonce_c2s = [0u8; AEAD_NONCE_SIZE];
        let mut nonce_s2c = [0u8; AEAD_NONCE_SIZE];
        let mut sas_bytes = [0u8; SAS_SIZE];

        let expanded = hk
            .expand(INFO_KEY_C2S, &mut key_c2s)
            .and_then(|_| hk.expand(INFO_KEY_S2C, &mut key_s2c))
            .and_then(|_| hk.expand(INFO_NONCE_C2S, &mut nonce_c2s))
            .and_then(|_| hk.expand(INFO_NONCE_S2C, &mut nonce_s2c))
            .and_then(|_| hk.expand(INFO_SAS, &mut sas_bytes));
        if expanded.is_err() {
            key_c2s.zeroize();
            key_s2c.zeroize();
            nonce_c2s.zeroize();
            nonce_s2c.zeroize();
            sas_bytes.zeroize();
            combined_salt.zeroize();
            return Err(CryptoError::KeyDerivationFailed);
        }

        // Directional assignment copies into fresh owned buffers.
        let keys = if is_server {
            DirectionalKeys {
                tx_key: key_s2c,
                rx_key: key_c2s,
                tx_base_nonce: nonce_s2c,
                rx_base_nonce: nonce_c2s,
            }
        } else {
            DirectionalKeys {
                tx_key: key_c2s,
                rx_key: key_s2c,
                tx_base_nonce: nonce_c2s,
                rx_base_nonce: nonce_s2c,
            }
        };
        let sas = Sas::from_bytes(&sas_bytes);

        key_c2s.zeroize();
        key_s2c.zeroize();
        nonce_c2s.zeroize();
        nonce_s2c.zeroize();
        sas_bytes.zeroize();
        combined_salt.zeroize();

        Ok((keys, sas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_pair() -> ((DirectionalKeys, Sas), (DirectionalKeys, Sas)) {
        let client = SessionCrypto::new().unwrap();
        let server = SessionCrypto::new().unwrap();

        let client_pub = client.public_key_der().to_vec();
        let client_salt = *client.salt();
        let server_pub = server.public_key_der().to_vec();
        let server_salt = *server.salt();

        let client_out = client.derive(&server_pub, &server_salt, false).unwrap();
        let server_out = server.derive(&client_pub, &client_salt, true).unwrap();
        (client_out, server_out)
    }

    #[test]
    fn test_public_key_is_spki_der() {
        let crypto = SessionCrypto::new().unwrap();
        let der = crypto.public_key_der();
        // SPKI for P-256 uncompressed points is a 91-byte SEQUENCE.
        assert_eq!(der[0], 0x30);
        assert_eq!(der.len(), 91);
        assert!(PublicKey::from_public_key_der(der).is_ok());
    }

    #[test]
    fn test_directional_keys_align_across_roles() {
        let ((client_keys, _), (server_keys, _)) = handshake_pair();

        // Compare hex-encoded so a mismatch prints something readable.
        assert_eq!(
            hex::encode(client_keys.tx_key()),
            hex::encode(server_keys.rx_key())
        );
        assert_eq!(
            hex::encode(client_keys.rx_key()),
            hex::encode(server_keys.tx_key())
        );
        assert_eq!(
            hex::encode(client_keys.tx_base_nonce()),
            hex::encode(server_keys.rx_base_nonce())
        );
        assert_eq!(
            hex::encode(client_keys.rx_base_nonce()),
            hex::encode(server_keys.tx_base_nonce())
        );
    }

    #[test]
    fn test_directions_are_separated() {
        let ((client_keys, _), _) = handshake_pair();
        assert_ne!(client_keys.tx_key(), client_keys.rx_key());
        assert_ne!(client_keys.tx_base_nonce(), client_keys.rx_base_nonce());
    }

    #[test]
    fn test_sas_agreement() {
        let ((_, client_sas), (_, server_sas)) = handshake_pair();
        assert_eq!(client_sas, server_sas);
    }

    #[test]
    fn test_distinct_handshakes_produce_distinct_keys() {
        let ((first, _), _) = handshake_pair();
        let ((second, _), _) = handshake_pair();
        assert_ne!(first.tx_key(), second.tx_key());
    }

    #[test]
    fn test_garbage_peer_key_is_curve_mismatch() {
        let crypto = SessionCrypto::new().unwrap();
        let result = crypto.derive(&[0xFF; 91], &[0u8; SALT_SIZE], false);
        assert!(matches!(result, Err(CryptoError::CurveMismatch)));
    }

    #[test]
    fn test_salts_are_random_per_instance() {
        let a = SessionCrypto::new().unwrap();
        let b = SessionCrypto::new().unwrap();
        assert_ne!(a.salt(), b.salt());
    }
}
