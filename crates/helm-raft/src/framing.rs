//! Length-prefixed message framing for TCP connections.
//!
//! Each message is framed as:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────┐
//! │   Length     │   Checksum   │            Payload               │
//! │   (4 bytes)  │   (4 bytes)  │         (variable)               │
//! └──────────────┴──────────────┴──────────────────────────────────┘
//! ```
//!
//! - **Length**: big-endian `u32` of the payload size (excludes header)
//! - **Checksum**: CRC32 of the payload
//! - **Payload**: bincode-serialized message
//!
//! The decoder parses incrementally, so it works over both blocking reads
//! and partial buffers. Checksum or size violations are fatal to the
//! connection: the stream can no longer be trusted to be in sync.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the frame header in bytes (length + checksum).
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur during message framing.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    /// Payload checksum doesn't match.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Payload failed to deserialize.
    #[error("deserialization failed: {0}")]
    Deserialize(String),

    /// Message failed to serialize.
    #[error("serialization failed: {0}")]
    Serialize(String),

    /// The stream ended mid-frame.
    #[error("connection closed mid-frame")]
    UnexpectedEof,
}

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a message into a framed byte buffer.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, FramingError> {
    let payload = bincode::serialize(message).map_err(|e| FramingError::Serialize(e.to_string()))?;

    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(FramingError::FrameTooLarge {
            size: payload.len() as u32,
            max: MAX_FRAME_SIZE,
        });
    }

    let checksum = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Encodes a message and writes the frame to `writer`.
pub fn write_frame<T: Serialize, W: Write>(writer: &mut W, message: &T) -> Result<(), FramingError> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one complete frame from `reader` and decodes the message.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<Option<T>, FramingError> {
    let mut header = [0u8; HEADER_SIZE];
    match read_exact_or_eof(reader, &mut header)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Full => {}
        ReadOutcome::Partial => return Err(FramingError::UnexpectedEof),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let checksum = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if length > MAX_FRAME_SIZE {
        return Err(FramingError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => FramingError::UnexpectedEof,
            _ => FramingError::Io(e),
        })?;

    let actual = crc32fast::hash(&payload);
    if actual != checksum {
        return Err(FramingError::ChecksumMismatch {
            expected: checksum,
            actual,
        });
    }

    let message =
        bincode::deserialize(&payload).map_err(|e| FramingError::Deserialize(e.to_string()))?;
    Ok(Some(message))
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

/// Fills `buf`, distinguishing a clean EOF before the first byte from a
/// truncated read.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, FramingError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FramingError::Io(e)),
        }
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod framing_tests {
    use super::*;
    use std::io::Cursor;

    use crate::message::{Request, Response, VoteResponse};
    use helm_types::Term;

    fn test_request() -> Request {
        Request::Get {
            key: bytes::Bytes::from_static(b"some-key"),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let original = test_request();
        let frame = encode_frame(&original).unwrap();
        assert!(frame.len() > HEADER_SIZE);

        let mut cursor = Cursor::new(frame);
        let decoded: Request = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let mut buffer = Vec::new();
        let messages: Vec<Response> = (0..5)
            .map(|i| {
                Response::RequestVote(VoteResponse {
                    term: Term::new(i),
                    vote_granted: i % 2 == 0,
                })
            })
            .collect();

        for message in &messages {
            write_frame(&mut buffer, message).unwrap();
        }

        let mut cursor = Cursor::new(buffer);
        for original in &messages {
            let decoded: Response = read_frame(&mut cursor).unwrap().unwrap();
            assert_eq!(&decoded, original);
        }

        // Clean EOF at the frame boundary.
        let done: Option<Response> = read_frame(&mut cursor).unwrap();
        assert!(done.is_none());
    }

    #[test]
    fn checksum_mismatch_detected() {
        let mut frame = encode_frame(&test_request()).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut cursor = Cursor::new(frame);
        let result: Result<Option<Request>, _> = read_frame(&mut cursor);
        assert!(matches!(result, Err(FramingError::ChecksumMismatch { .. })));
    }

    #[test]
    fn truncated_frame_detected() {
        let frame = encode_frame(&test_request()).unwrap();

        // Cut the frame short mid-payload.
        let mut cursor = Cursor::new(frame[..frame.len() - 2].to_vec());
        let result: Result<Option<Request>, _> = read_frame(&mut cursor);
        assert!(matches!(result, Err(FramingError::UnexpectedEof)));

        // Cut mid-header.
        let mut cursor = Cursor::new(frame[..4].to_vec());
        let result: Result<Option<Request>, _> = read_frame(&mut cursor);
        assert!(matches!(result, Err(FramingError::UnexpectedEof)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());

        let mut cursor = Cursor::new(frame);
        let result: Result<Option<Request>, _> = read_frame(&mut cursor);
        assert!(matches!(result, Err(FramingError::FrameTooLarge { .. })));
    }

    #[test]
    fn frame_structure() {
        let frame = encode_frame(&test_request()).unwrap();

        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let checksum = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

        assert_eq!(length as usize, frame.len() - HEADER_SIZE);
        assert_eq!(checksum, crc32fast::hash(&frame[HEADER_SIZE..]));
    }
}
