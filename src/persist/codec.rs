//! Binary codec for the log and snapshot files.
//!
//! File header:
//! ```text
//! [MAGIC: 4 bytes "SREG"][FORMAT VERSION: u32 LE][TAG LEN: u16 LE][TAG: UTF-8]
//! ```
//! Record:
//! ```text
//! [length: u32 LE][payload: bincode][crc32: u32 LE]
//! ```
//! A record cut short by end-of-file surfaces as `UnexpectedEof`; every other
//! defect (bad checksum, undecodable payload, oversized length) surfaces as
//! `InvalidData`. An `UnexpectedEof` is only a torn tail if no complete
//! record follows the short one; see [`find_frame`].

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Magic bytes identifying registrar files.
pub const MAGIC: [u8; 4] = *b"SREG";

/// Version of the on-disk layout. Any other version is refused.
pub const FORMAT_VERSION: u32 = 1;

/// Names the implementation that wrote the file.
pub const IMPLEMENTATION_TAG: &str = "svcreg.registrar";

/// Upper bound on a single record.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Frames one value.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = bincode::serialize(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    if data.len() > MAX_RECORD_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {} exceeds maximum {MAX_RECORD_SIZE}", data.len()),
        ));
    }

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let len = u32::try_from(data.len()).map_err(|_| IoError::new(ErrorKind::InvalidData, "record too large"))?;
    let mut out = Vec::with_capacity(4 + data.len() + 4);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Reads one framed value, verifying its checksum.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {len} exceeds maximum {MAX_RECORD_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x}"),
        ));
    }

    bincode::deserialize(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Offset of the first complete, checksum-valid record in `bytes`.
///
/// Used to tell a torn final append from a damaged length prefix: a torn
/// tail is a prefix of one record, so no whole record can follow it.
#[must_use]
pub fn find_frame(bytes: &[u8]) -> Option<usize> {
    (0..bytes.len().saturating_sub(8)).find(|&at| {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[at..at + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        // An empty payload checksums to zero, so runs of zero bytes would match.
        if len == 0 || len > MAX_RECORD_SIZE || at + 8 + len > bytes.len() {
            return false;
        }
        let payload = &bytes[at + 4..at + 4 + len];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&bytes[at + 4 + len..at + 8 + len]);
        let mut hasher = Hasher::new();
        hasher.update(payload);
        hasher.finalize() == u32::from_le_bytes(crc_bytes)
    })
}

pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    let tag = IMPLEMENTATION_TAG.as_bytes();
    let tag_len = u16::try_from(tag.len()).map_err(|_| IoError::new(ErrorKind::InvalidInput, "tag too long"))?;
    writer.write_all(&MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&tag_len.to_le_bytes())?;
    writer.write_all(tag)?;
    Ok(())
}

/// Length of the header [`write_header`] produces.
#[must_use]
pub fn header_len() -> u64 {
    (MAGIC.len() + 4 + 2 + IMPLEMENTATION_TAG.len()) as u64
}

/// Reads and validates the header. A file written by a different version
/// or implementation is `InvalidData`.
pub fn read_header(reader: &mut impl Read) -> IoResult<()> {
    let invalid = |msg: String| IoError::new(ErrorKind::InvalidData, msg);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(|e| invalid(format!("truncated header: {e}")))?;
    if magic != MAGIC {
        return Err(invalid(format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}")));
    }

    let mut version = [0u8; 4];
    reader.read_exact(&mut version).map_err(|e| invalid(format!("truncated header: {e}")))?;
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(invalid(format!(
            "unsupported format version {version} (expected {FORMAT_VERSION})"
        )));
    }

    let mut tag_len = [0u8; 2];
    reader.read_exact(&mut tag_len).map_err(|e| invalid(format!("truncated header: {e}")))?;
    let mut tag = vec![0u8; usize::from(u16::from_le_bytes(tag_len))];
    reader.read_exact(&mut tag).map_err(|e| invalid(format!("truncated header: {e}")))?;
    if tag != IMPLEMENTATION_TAG.as_bytes() {
        return Err(invalid(format!(
            "file written by '{}', expected '{IMPLEMENTATION_TAG}'",
            String::from_utf8_lossy(&tag)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode(&"test data".to_string()).unwrap();
        encoded[6] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn test_short_record_is_eof() {
        let encoded = encode(&vec![7u64; 16]).unwrap();
        let torn = &encoded[..encoded.len() - 3];
        let err = decode::<Vec<u64>>(&mut Cursor::new(torn)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_oversized_record() {
        let mut bad = Vec::new();
        bad.extend_from_slice(&(200_000_000u32).to_le_bytes());
        let err = decode::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_find_frame_skips_garbage() {
        let record = encode(&"payload".to_string()).unwrap();
        let mut bytes = vec![0u8; 13];
        bytes.extend_from_slice(&record);
        assert_eq!(find_frame(&bytes), Some(13));

        // A torn record never contains a whole one.
        assert_eq!(find_frame(&record[..record.len() - 1]), None);
        assert_eq!(find_frame(&[0u8; 64]), None);
    }

    #[test]
    fn test_header_checks() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, header_len());
        read_header(&mut Cursor::new(&buf)).unwrap();

        let mut wrong_version = buf.clone();
        wrong_version[4] = 9;
        let err = read_header(&mut Cursor::new(wrong_version)).unwrap_err();
        assert!(err.to_string().contains("format version"));

        let mut wrong_tag = buf.clone();
        let last = wrong_tag.len() - 1;
        wrong_tag[last] = b'X';
        assert_eq!(read_header(&mut Cursor::new(wrong_tag)).unwrap_err().kind(), ErrorKind::InvalidData);

        assert_eq!(read_header(&mut Cursor::new(b"XLOG")).unwrap_err().kind(), ErrorKind::InvalidData);
    }
}
