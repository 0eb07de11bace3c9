//! State-machine command encoding.
//!
//! Commands travel on the replicated log as opaque bytes and are decoded
//! again at apply time. The framing is length-prefixed so keys and values
//! may contain any byte:
//!
//! ```text
//! PUT: 0x01 | klen (4B, BE) | key | vlen (4B, BE) | value
//! DEL: 0x02 | klen (4B, BE) | key
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Opcode for a put command.
const OP_PUT: u8 = 0x01;

/// Opcode for a delete command.
const OP_DEL: u8 = 0x02;

/// Errors from decoding a log command.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    /// The buffer ended before the declared lengths were satisfied.
    #[error("truncated command")]
    Truncated,

    /// The opcode byte is not a known operation.
    #[error("unknown command opcode {0:#04x}")]
    UnknownOp(u8),

    /// Bytes remained after the command was fully decoded.
    #[error("trailing bytes after command")]
    TrailingBytes,
}

/// A mutating operation carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store `value` under `key`.
    Put { key: Bytes, value: Bytes },
    /// Remove `key`.
    Delete { key: Bytes },
}

impl Command {
    /// Creates a put command.
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a delete command.
    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// Returns the key the command operates on.
    pub fn key(&self) -> &Bytes {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Serializes the command for the log.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Put { key, value } => {
                let mut buf = BytesMut::with_capacity(1 + 4 + key.len() + 4 + value.len());
                buf.put_u8(OP_PUT);
                buf.put_u32(key.len() as u32);
                buf.put_slice(key);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
                buf.freeze()
            }
            Self::Delete { key } => {
                let mut buf = BytesMut::with_capacity(1 + 4 + key.len());
                buf.put_u8(OP_DEL);
                buf.put_u32(key.len() as u32);
                buf.put_slice(key);
                buf.freeze()
            }
        }
    }

    /// Decodes a command from log bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CommandError> {
        let mut buf = data;

        if buf.remaining() < 1 {
            return Err(CommandError::Truncated);
        }
        let op = buf.get_u8();

        let key = take_prefixed(&mut buf)?;
        let command = match op {
            OP_PUT => {
                let value = take_prefixed(&mut buf)?;
                Self::Put { key, value }
            }
            OP_DEL => Self::Delete { key },
            other => return Err(CommandError::UnknownOp(other)),
        };

        if buf.has_remaining() {
            return Err(CommandError::TrailingBytes);
        }
        Ok(command)
    }
}

/// Reads a `u32`-length-prefixed byte run.
fn take_prefixed(buf: &mut &[u8]) -> Result<Bytes, CommandError> {
    if buf.remaining() < 4 {
        return Err(CommandError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(CommandError::Truncated);
    }
    let bytes = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(bytes)
}

#[cfg(test)]
mod command_tests {
    use super::*;

    #[test]
    fn put_roundtrip() {
        let cmd = Command::put(&b"key"[..], &b"value"[..]);
        let encoded = cmd.encode();
        assert_eq!(encoded[0], OP_PUT);
        assert_eq!(Command::decode(&encoded).unwrap(), cmd);
    }

    #[test]
    fn delete_roundtrip() {
        let cmd = Command::delete(&b"key"[..]);
        let encoded = cmd.encode();
        assert_eq!(encoded[0], OP_DEL);
        assert_eq!(Command::decode(&encoded).unwrap(), cmd);
    }

    #[test]
    fn spaces_in_keys_and_values_survive() {
        // The whole point of length prefixes: ambiguous bytes are fine.
        let cmd = Command::put(&b"a key with spaces"[..], &b"a value  with  spaces"[..]);
        assert_eq!(Command::decode(&cmd.encode()).unwrap(), cmd);

        let cmd = Command::delete(&b"DEL PUT "[..]);
        assert_eq!(Command::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn empty_key_and_value() {
        let cmd = Command::put(Bytes::new(), Bytes::new());
        assert_eq!(Command::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(Command::decode(&[]), Err(CommandError::Truncated));
        assert_eq!(Command::decode(&[0x07]), Err(CommandError::Truncated));
        assert_eq!(
            Command::decode(&[0x07, 0, 0, 0, 0]),
            Err(CommandError::UnknownOp(0x07))
        );
        // Declared key length runs past the buffer.
        assert_eq!(
            Command::decode(&[OP_DEL, 0, 0, 0, 10, b'x']),
            Err(CommandError::Truncated)
        );
        // Trailing junk after a complete command.
        let mut encoded = Command::delete(&b"k"[..]).encode().to_vec();
        encoded.push(0xff);
        assert_eq!(Command::decode(&encoded), Err(CommandError::TrailingBytes));
    }
}
