//! Error types for the Local P2P protocol.

use thiserror::Error;

/// Errors raised by the frame codec while reassembling the byte stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The length prefix declared zero bytes.
    #[error("frame length prefix is zero")]
    InvalidLength,

    /// The length prefix exceeded the frame size cap.
    #[error("frame length {declared} exceeds maximum {max}")]
    Oversize {
        /// Length declared by the prefix.
        declared: usize,
        /// The protocol's frame size cap.
        max: usize,
    },
}

/// Errors raised while decoding a typed frame from its payload bytes.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The message type byte is not part of the protocol.
    #[error("unknown message type 0x{0:02x}")]
    UnknownTag(u8),

    /// The payload ended before the structure it declared.
    #[error("truncated payload for message type 0x{tag:02x}")]
    Truncated {
        /// Message type being decoded.
        tag: u8,
    },

    /// A declared length field points past the end of the payload.
    #[error("length field out of bounds for message type 0x{tag:02x}")]
    LengthOutOfBounds {
        /// Message type being decoded.
        tag: u8,
    },

    /// A file chunk carried a negative offset.
    #[error("negative file chunk offset")]
    NegativeOffset,

    /// A payload required to be empty carried bytes.
    #[error("unexpected payload for message type 0x{tag:02x}")]
    UnexpectedPayload {
        /// Message type being decoded.
        tag: u8,
    },

    /// A path or text field is not valid UTF-8.
    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    /// A JSON payload failed to parse or serialize.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The peer's public key is not a valid P-256 SPKI document.
    #[error("peer public key is not a valid P-256 key")]
    CurveMismatch,

    /// HKDF expansion failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD tag verification failed; the frame was forged or corrupted.
    #[error("AEAD authentication failed")]
    AuthenticationFailed,

    /// A direction's sequence counter saturated; the session must terminate.
    #[error("AEAD sequence counter exhausted")]
    SequenceExhausted,
}

/// Fatal engine conditions. Every variant terminates the session.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Frame codec failure on the inbound byte stream.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Typed frame decode failure.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Crypto layer failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Our version.
        expected: String,
        /// The peer's version.
        actual: String,
    },

    /// A frame or command arrived in a state that does not permit it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The local user declined the short authentication string.
    #[error("SAS rejected by local user")]
    SasRejected,

    /// The peer declined the short authentication string.
    #[error("SAS rejected by peer")]
    PeerRejectedSas,
}
