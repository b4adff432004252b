//! Security layer.
//!
//! Fixed cryptographic suite, no negotiation: P-256 ECDH for the ephemeral
//! exchange, HKDF-SHA256 for the directional key schedule, AES-256-GCM for
//! every frame after the handshake cutover, and a four-emoji Short
//! Authentication String for the out-of-band human check.

mod aead;
mod handshake;
mod sas;

pub use aead::*;
pub use handshake::*;
pub use sas::*;
