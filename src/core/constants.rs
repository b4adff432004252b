//! Protocol constants.
//!
//! These values are fixed by the wire protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// FRAMING
// =============================================================================

/// Size of the big-endian length prefix on every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum value the length prefix may carry (type byte + payload).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Initial capacity of the codec's reassembly buffer.
pub const CODEC_INITIAL_CAPACITY: usize = 64 * 1024;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// Hello (cleartext): JSON `{version, device_name}`.
pub const MSG_HELLO: u8 = 0x01;

/// Key exchange (cleartext): public key + salt.
pub const MSG_KEY_EXCHANGE: u8 = 0x02;

/// Authentication verdict after SAS comparison.
pub const MSG_AUTH_VERIFY: u8 = 0x03;

/// Request for the peer's file manifest.
pub const MSG_REQUEST_TREE: u8 = 0x04;

/// File manifest: JSON array of file entries.
pub const MSG_FILE_TREE_CHUNK: u8 = 0x05;

/// Request for one file's contents.
pub const MSG_FILE_REQUEST: u8 = 0x06;

/// One chunk of file data at an explicit offset.
pub const MSG_FILE_CHUNK: u8 = 0x07;

/// End-of-file marker for a streamed file.
pub const MSG_FILE_COMPLETE: u8 = 0x08;

// =============================================================================
// PROTOCOL VERSION
// =============================================================================

/// Version carried in the Hello message. Mismatches are fatal.
pub const PROTOCOL_VERSION: &str = "1.1";

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// AES-256-GCM key size.
pub const SESSION_KEY_SIZE: usize = 32;

/// AES-GCM nonce size.
pub const AEAD_NONCE_SIZE: usize = 12;

/// GCM authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Random salt contributed by each side to the key schedule.
pub const SALT_SIZE: usize = 32;

/// Number of SAS bytes, one emoji token each.
pub const SAS_SIZE: usize = 4;

/// HKDF info string: client-to-server key.
pub const INFO_KEY_C2S: &[u8] = b"local-p2p v1.1 key c2s";

/// HKDF info string: server-to-client key.
pub const INFO_KEY_S2C: &[u8] = b"local-p2p v1.1 key s2c";

/// HKDF info string: client-to-server base nonce.
pub const INFO_NONCE_C2S: &[u8] = b"local-p2p v1.1 nonce c2s";

/// HKDF info string: server-to-client base nonce.
pub const INFO_NONCE_S2C: &[u8] = b"local-p2p v1.1 nonce s2c";

/// HKDF info string: short authentication string.
pub const INFO_SAS: &[u8] = b"local-p2p v1.1 sas";

// =============================================================================
// FILE TRANSFER
// =============================================================================

/// Chunk size used when streaming file contents.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Suffix appended to a file's final path while it is being written.
pub const TEMP_SUFFIX: &str = ".tmp";

// =============================================================================
// TIMING
// =============================================================================

/// How long the orchestrator waits for the remote manifest.
pub const TREE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
