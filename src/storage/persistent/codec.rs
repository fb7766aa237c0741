//! Binary codec for index log frames.
//!
//! Every frame is serialized with:
//! - JSON for data (serde attributes on the record types)
//! - Length-prefixed format for framing, the length guarded by its own CRC32
//! - CRC32 checksum for corruption detection
//! - Version byte for forward compatibility

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying KyroBlock index logs.
pub const MAGIC: [u8; 4] = *b"KBLK";

/// Size of the file header: magic plus version.
pub const HEADER_LEN: u64 = 5;

/// Largest frame payload accepted on decode (100 MB).
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Bytes before the payload: version, length, length checksum.
pub const FRAME_PREFIX_LEN: usize = 1 + 4 + 4;

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Serializes a value to one checksummed frame.
///
/// Format:
/// ```text
/// [version: 1 byte][length: 4 bytes LE][length crc32: 4 bytes LE]
/// [data: N bytes JSON][crc32: 4 bytes LE]
/// ```
///
/// The length checksum lets a reader tell a frame cut short by a crash
/// (intact prefix, missing bytes) from a damaged length field.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidData, "frame larger than 4 GiB"))?;

    let len_bytes = len.to_le_bytes();

    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(&crc32(&len_bytes).to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc32(&data).to_le_bytes());
    Ok(out)
}

/// Deserializes one frame, verifying its checksum.
///
/// # Errors
/// - `UnexpectedEof` if the reader ends mid-frame (a torn write)
/// - `InvalidData` on version, length checksum, size, checksum, or JSON failures
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let mut len_crc = [0u8; 4];
    reader.read_exact(&mut len_crc)?;
    if u32::from_le_bytes(len_crc) != crc32(&len_bytes) {
        return Err(IoError::new(ErrorKind::InvalidData, "frame length checksum mismatch"));
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);
    let computed_crc = crc32(&data);
    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x}"),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Writes the file header (magic + version).
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Reads and validates the file header, returning its version.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported log version: {}", version[0]),
        ));
    }
    Ok(version[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_roundtrip_simple() {
        let value = vec![1u64, 2, 3];
        let encoded = encode(&value).unwrap();
        let decoded: Vec<u64> = decode(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode(&"block data".to_string()).unwrap();
        encoded[FRAME_PREFIX_LEN + 2] ^= 0xFF;

        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame_is_unexpected_eof() {
        let encoded = encode(&"torn".to_string()).unwrap();
        let torn = &encoded[..encoded.len() - 2];

        let err = decode::<String>(&mut Cursor::new(torn)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let len = 200_000_000u32.to_le_bytes();
        let mut bad = vec![CODEC_VERSION];
        bad.extend_from_slice(&len);
        bad.extend_from_slice(&crc32(&len).to_le_bytes());

        let err = decode::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_damaged_length_is_invalid_not_torn() {
        let mut encoded = encode(&"length".to_string()).unwrap();
        // Length now points far past the end of the buffer.
        encoded[2] = 0x10;

        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("length checksum"));
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);
        assert_eq!(read_header(&mut Cursor::new(buf)).unwrap(), CODEC_VERSION);
    }

    #[test]
    fn test_rejects_foreign_magic() {
        let err = read_header(&mut Cursor::new(b"KYRO\x01".to_vec())).unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }
}
