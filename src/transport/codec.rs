//! Length-prefixed frame codec.
//!
//! Wire format: `[4-byte big-endian length N][1-byte type][N-1 bytes payload]`.
//! The length counts the type byte plus the payload, so `N >= 1` always.
//!
//! The codec is a stateful reassembler: the transport hands it raw byte
//! chunks in arrival order, and it yields whole frames as they become
//! available. Partial trailers stay buffered across calls. Bytes are never
//! silently discarded; an invalid length is fatal for the connection.

use crate::core::{CodecError, CODEC_INITIAL_CAPACITY, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};

/// Incremental reassembler for length-prefixed frames.
///
/// Each emitted frame is the `[type || payload]` slice with the length
/// prefix stripped.
#[derive(Debug)]
pub struct FrameCodec {
    /// Reassembly buffer. Valid bytes live in `buf[start..end]`.
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl FrameCodec {
    /// Create a codec with the default initial buffer capacity.
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; CODEC_INITIAL_CAPACITY],
            start: 0,
            end: 0,
        }
    }

    /// Number of buffered bytes not yet emitted as frames.
    pub fn pending(&self) -> usize {
        self.end - self.start
    }

    /// Append a chunk from the byte stream and return every frame that is
    /// now complete, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        self.reserve(chunk.len());
        self.buf[self.end..self.end + chunk.len()].copy_from_slice(chunk);
        self.end += chunk.len();

        let mut frames = Vec::new();
        loop {
            let pending = &self.buf[self.start..self.end];
            if pending.len() < LENGTH_PREFIX_SIZE {
                break;
            }

            let declared =
                u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
            if declared == 0 {
                return Err(CodecError::InvalidLength);
            }
            if declared > MAX_FRAME_SIZE {
                return Err(CodecError::Oversize {
                    declared,
                    max: MAX_FRAME_SIZE,
                });
            }

            if pending.len() < LENGTH_PREFIX_SIZE + declared {
                break;
            }

            let frame =
                pending[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + declared].to_vec();
            self.start += LENGTH_PREFIX_SIZE + declared;
            frames.push(frame);
            self.compact();
        }

        Ok(frames)
    }

    /// Grow the buffer (doubling) until `extra` more bytes fit after `end`.
    fn reserve(&mut self, extra: usize) {
        if self.end + extra <= self.buf.len() {
            return;
        }
        // Compacting first may already make room.
        self.compact();
        let mut capacity = self.buf.len().max(CODEC_INITIAL_CAPACITY);
        while self.end + extra > capacity {
            capacity *= 2;
        }
        self.buf.resize(capacity, 0);
    }

    /// Move the residual tail to the front of the buffer.
    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one frame for the wire: length prefix, type byte, payload.
pub fn encode_frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let declared = 1 + payload.len();
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + declared);
    out.extend_from_slice(&(declared as u32).to_be_bytes());
    out.push(msg_type);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_single_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let wire = encode_frame(0x05, b"hello");

        let frames = codec.feed(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], 0x05);
        assert_eq!(&frames[0][1..], b"hello");
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut codec = FrameCodec::new();
        let frames = codec.feed(&encode_frame(0x04, b"")).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![0x04]);
    }

    #[test]
    fn test_byte_at_a_time_reassembly() {
        let mut codec = FrameCodec::new();
        let wire = encode_frame(0x07, &[0xAA; 300]);

        let mut frames = Vec::new();
        for byte in &wire {
            frames.extend(codec.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 301);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut codec = FrameCodec::new();
        let mut wire = encode_frame(0x01, b"a");
        wire.extend(encode_frame(0x02, b"bb"));
        wire.extend(encode_frame(0x03, b"ccc"));

        let frames = codec.feed(&wire).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[2][1..], b"ccc");
    }

    #[test]
    fn test_partial_trailer_stays_buffered() {
        let mut codec = FrameCodec::new();
        let wire = encode_frame(0x05, b"payload");

        let frames = codec.feed(&wire[..wire.len() - 3]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(codec.pending(), wire.len() - 3);

        let frames = codec.feed(&wire[wire.len() - 3..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_zero_length_is_fatal() {
        let mut codec = FrameCodec::new();
        let result = codec.feed(&[0, 0, 0, 0, 0x01]);
        assert_eq!(result, Err(CodecError::InvalidLength));
    }

    #[test]
    fn test_oversize_rejected_from_header_alone() {
        let mut codec = FrameCodec::new();
        let declared = (MAX_FRAME_SIZE + 1) as u32;
        // Only the header arrives; rejection must not wait for the body.
        let result = codec.feed(&declared.to_be_bytes());
        assert!(matches!(result, Err(CodecError::Oversize { .. })));
    }

    #[test]
    fn test_max_size_frame_accepted() {
        let mut codec = FrameCodec::new();
        let payload = vec![0x42u8; MAX_FRAME_SIZE - 1];
        let frames = codec.feed(&encode_frame(0x07, &payload)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn test_fragmented_stream_torture() {
        let mut rng = StdRng::seed_from_u64(0x10CA1);

        // 50 frames with random payload sizes in [1, 100000).
        let mut originals = Vec::new();
        let mut wire = Vec::new();
        for _ in 0..50 {
            let len = rng.gen_range(1..100_000);
            let mut payload = vec![0u8; len];
            rng.fill(payload.as_mut_slice());
            let tag = rng.gen_range(0x01..=0x08);

            let mut frame = vec![tag];
            frame.extend_from_slice(&payload);
            wire.extend(encode_frame(tag, &payload));
            originals.push(frame);
        }

        // Feed in random chunks of [1, 1400) bytes.
        let mut codec = FrameCodec::new();
        let mut reassembled = Vec::new();
        let mut cursor = 0;
        while cursor < wire.len() {
            let take = rng.gen_range(1..1400).min(wire.len() - cursor);
            reassembled.extend(codec.feed(&wire[cursor..cursor + take]).unwrap());
            cursor += take;
        }

        assert_eq!(reassembled, originals);
        assert_eq!(codec.pending(), 0);
    }
}
