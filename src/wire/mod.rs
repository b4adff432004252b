//! Typed wire frames.
//!
//! Every protocol message is `[1-byte type][payload]` once the length prefix
//! is stripped by the codec. This module gives each message kind a typed
//! representation with byte-exact encode/decode.
//!
//! Payload formats:
//!
//! | Tag  | Name          | Payload |
//! |------|---------------|---------|
//! | 0x01 | Hello         | JSON `{version, device_name}` |
//! | 0x02 | KeyExchange   | `[4B BE pubkey_len][pubkey][32B salt]` |
//! | 0x03 | AuthVerify    | one byte, 1 = accepted |
//! | 0x04 | RequestTree   | empty |
//! | 0x05 | FileTreeChunk | JSON array of [`FileEntry`] |
//! | 0x06 | FileRequest   | JSON `{relative_path}` |
//! | 0x07 | FileChunk     | `[2B BE path_len][path][8B BE offset][data]` |
//! | 0x08 | FileComplete  | JSON `{relative_path}` |
//!
//! Hello and KeyExchange always travel in the clear; everything else is AEAD
//! ciphertext on the wire after the handshake cutover. The payloads here are
//! the plaintext forms.

use serde::{Deserialize, Serialize};

use crate::core::{
    FrameError, MSG_AUTH_VERIFY, MSG_FILE_CHUNK, MSG_FILE_COMPLETE, MSG_FILE_REQUEST,
    MSG_FILE_TREE_CHUNK, MSG_HELLO, MSG_KEY_EXCHANGE, MSG_REQUEST_TREE, SALT_SIZE,
};

/// One regular file in a manifest.
///
/// Produced by the scanner and immutable afterwards. Diff equality is by
/// `(size, last_write_ticks)`; `hash` is reserved for a future content check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Forward-slash, case-folded path relative to the sync root.
    pub relative_path: String,
    /// File size in bytes.
    pub size: u64,
    /// Modification time in 100 ns ticks.
    pub last_write_ticks: i64,
    /// Reserved content hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Body of the Hello message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version; must equal [`crate::core::PROTOCOL_VERSION`].
    pub version: String,
    /// Human-readable name of the sending device.
    pub device_name: String,
}

/// Body of FileRequest and FileComplete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPayload {
    /// Forward-slash path relative to the sync root.
    pub relative_path: String,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Version and device announcement (cleartext).
    Hello(Hello),
    /// Ephemeral public key + salt (cleartext).
    KeyExchange {
        /// SPKI DER encoding of the sender's P-256 public key.
        public_key: Vec<u8>,
        /// The sender's 32-byte random salt.
        salt: [u8; SALT_SIZE],
    },
    /// SAS verdict.
    AuthVerify {
        /// Whether the sender's user accepted the SAS.
        accepted: bool,
    },
    /// Ask the peer for its manifest.
    RequestTree,
    /// The peer's manifest.
    FileTreeChunk(Vec<FileEntry>),
    /// Ask the peer to stream one file.
    FileRequest(PathPayload),
    /// One span of file data.
    FileChunk {
        /// Path of the file being streamed.
        relative_path: String,
        /// Byte offset of `data` within the file.
        offset: u64,
        /// The chunk contents.
        data: Vec<u8>,
    },
    /// The streamed file is complete.
    FileComplete(PathPayload),
}

impl Frame {
    /// The message type byte for this frame.
    pub fn msg_type(&self) -> u8 {
        match self {
            Frame::Hello(_) => MSG_HELLO,
            Frame::KeyExchange { .. } => MSG_KEY_EXCHANGE,
            Frame::AuthVerify { .. } => MSG_AUTH_VERIFY,
            Frame::RequestTree => MSG_REQUEST_TREE,
            Frame::FileTreeChunk(_) => MSG_FILE_TREE_CHUNK,
            Frame::FileRequest(_) => MSG_FILE_REQUEST,
            Frame::FileChunk { .. } => MSG_FILE_CHUNK,
            Frame::FileComplete(_) => MSG_FILE_COMPLETE,
        }
    }

    /// Encode into `(msg_type, plaintext payload)`.
    pub fn encode(&self) -> Result<(u8, Vec<u8>), FrameError> {
        let payload = match self {
            Frame::Hello(hello) => serde_json::to_vec(hello)?,
            Frame::KeyExchange { public_key, salt } => {
                let mut out =
                    Vec::with_capacity(4 + public_key.len() + SALT_SIZE);
                out.extend_from_slice(&(public_key.len() as u32).to_be_bytes());
                out.extend_from_slice(public_key);
                out.extend_from_slice(salt);
                out
            }
            Frame::AuthVerify { accepted } => vec![u8::from(*accepted)],
            Frame::RequestTree => Vec::new(),
            Frame::FileTreeChunk(entries) => serde_json::to_vec(entries)?,
            Frame::FileRequest(path) => serde_json::to_vec(path)?,
            Frame::FileChunk {
                relative_path,
                offset,
                data,
            } => {
                let path = relative_path.as_bytes();
                let mut out = Vec::with_capacity(2 + path.len() + 8 + data.len());
                out.extend_from_slice(&(path.len() as u16).to_be_bytes());
                out.extend_from_slice(path);
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            Frame::FileComplete(path) => serde_json::to_vec(path)?,
        };
        Ok((self.msg_type(), payload))
    }

    /// Decode a frame from its message type and plaintext payload.
    pub fn decode(msg_type: u8, body: &[u8]) -> Result<Self, FrameError> {
        match msg_type {
            MSG_HELLO => Ok(Frame::Hello(serde_json::from_slice(body)?)),
            MSG_KEY_EXCHANGE => decode_key_exchange(body),
            MSG_AUTH_VERIFY => {
                if body.len() != 1 {
                    return Err(FrameError::Truncated { tag: msg_type });
                }
                Ok(Frame::AuthVerify {
                    accepted: body[0] == 1,
                })
            }
            MSG_REQUEST_TREE => {
                if !body.is_empty() {
                    return Err(FrameError::UnexpectedPayload { tag: msg_type });
                }
                Ok(Frame::RequestTree)
            }
            MSG_FILE_TREE_CHUNK => Ok(Frame::FileTreeChunk(serde_json::from_slice(body)?)),
            MSG_FILE_REQUEST => Ok(Frame::FileRequest(serde_json::from_slice(body)?)),
            MSG_FILE_CHUNK => decode_file_chunk(body),
            MSG_FILE_COMPLETE => Ok(Frame::FileComplete(serde_json::from_slice(body)?)),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

fn decode_key_exchange(body: &[u8]) -> Result<Frame, FrameError> {
    if body.len() < 4 {
        return Err(FrameError::Truncated {
            tag: MSG_KEY_EXCHANGE,
        });
    }
    let key_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let expected = 4 + key_len + SALT_SIZE;
    if key_len > body.len() - 4 {
        return Err(FrameError::LengthOutOfBounds {
            tag: MSG_KEY_EXCHANGE,
        });
    }
    if body.len() != expected {
        return Err(FrameError::Truncated {
            tag: MSG_KEY_EXCHANGE,
        });
    }

    let public_key = body[4..4 + key_len].to_vec();
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&body[4 + key_len..]);
    Ok(Frame::KeyExchange { public_key, salt })
}

/// Minimum FileChunk payload: 2-byte path length + 8-byte offset.
const FILE_CHUNK_MIN: usize = 10;

fn decode_file_chunk(body: &[u8]) -> Result<Frame, FrameError> {
    if body.len() < FILE_CHUNK_MIN {
        return Err(FrameError::Truncated { tag: MSG_FILE_CHUNK });
    }
    let path_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if 2 + path_len + 8 > body.len() {
        return Err(FrameError::LengthOutOfBounds { tag: MSG_FILE_CHUNK });
    }

    let relative_path = std::str::from_utf8(&body[2..2 + path_len])
        .map_err(|_| FrameError::InvalidUtf8)?
        .to_owned();

    let o = 2 + path_len;
    // The wire field is signed; a negative offset is a protocol error.
    let offset = i64::from_be_bytes([
        body[o],
        body[o + 1],
        body[o + 2],
        body[o + 3],
        body[o + 4],
        body[o + 5],
        body[o + 6],
        body[o + 7],
    ]);
    if offset < 0 {
        return Err(FrameError::NegativeOffset);
    }

    Ok(Frame::FileChunk {
        relative_path,
        offset: offset as u64,
        data: body[o + 8..].to_vec(),
    })
}
