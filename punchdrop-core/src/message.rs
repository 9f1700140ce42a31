//! Byte layouts of the two transfer payloads.
//!
//! ```text
//! MetaInfo:  password_hash \n file_name \n size(u64 BE, 8 bytes) \n file_hash \n
//! ChunkInfo: final(0x00|0x01) data…
//! ```
//!
//! Neither layout carries a length prefix: the frame around it (see
//! [`crate::protocol`]) already delimits the message.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const DELIMITER: u8 = b'\n';
const SIZE_LEN: usize = 8;

const FLAG_FINAL: u8 = 0x01;
const FLAG_MORE: u8 = 0x00;

/// Description of the file about to be transferred.
#[derive(Clone, PartialEq, Eq)]
pub struct MetaInfo {
    pub password_hash: Vec<u8>,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: Vec<u8>,
}

impl MetaInfo {
    /// Encodes the file info.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if a delimited field contains a
    /// newline or the password hash is empty; such a value could not be
    /// decoded back unambiguously.
    pub fn encode(&self) -> Result<Bytes> {
        if self.password_hash.is_empty() {
            return Err(Error::MalformedMessage("password hash is empty".into()));
        }
        check_field("password hash", &self.password_hash)?;
        check_field("file name", self.file_name.as_bytes())?;
        check_field("file hash", &self.file_hash)?;

        let mut buf = BytesMut::with_capacity(
            self.password_hash.len() + self.file_name.len() + SIZE_LEN + self.file_hash.len() + 4,
        );
        buf.put_slice(&self.password_hash);
        buf.put_u8(DELIMITER);
        buf.put_slice(self.file_name.as_bytes());
        buf.put_u8(DELIMITER);
        buf.put_u64(self.file_size);
        buf.put_u8(DELIMITER);
        buf.put_slice(&self.file_hash);
        buf.put_u8(DELIMITER);
        Ok(buf.freeze())
    }

    /// Decodes file info produced by [`MetaInfo::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if a delimiter is missing, the
    /// password hash is empty, the size field is not exactly eight bytes, or
    /// the file name is not UTF-8.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (password_hash, rest) = split_field(buf, "password hash")?;
        if password_hash.is_empty() {
            return Err(Error::MalformedMessage("password hash is empty".into()));
        }
        let (file_name, rest) = split_field(rest, "file name")?;

        if rest.len() <= SIZE_LEN || rest[SIZE_LEN] != DELIMITER {
            return Err(Error::MalformedMessage(
                "file size is not 8 bytes followed by a delimiter".into(),
            ));
        }
        let mut size = [0u8; SIZE_LEN];
        size.copy_from_slice(&rest[..SIZE_LEN]);
        let rest = &rest[SIZE_LEN + 1..];

        let (file_hash, trailing) = split_field(rest, "file hash")?;
        if !trailing.is_empty() {
            return Err(Error::MalformedMessage(format!(
                "{} trailing bytes after file hash",
                trailing.len()
            )));
        }

        let file_name = std::str::from_utf8(file_name)
            .map_err(|_| Error::MalformedMessage("file name is not valid UTF-8".into()))?
            .to_owned();

        Ok(Self {
            password_hash: password_hash.to_vec(),
            file_name,
            file_size: u64::from_be_bytes(size),
            file_hash: file_hash.to_vec(),
        })
    }
}

impl fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaInfo")
            .field("password_hash", &String::from_utf8_lossy(&self.password_hash))
            .field("file_name", &self.file_name)
            .field("file_size", &self.file_size)
            .field("file_hash", &String::from_utf8_lossy(&self.file_hash))
            .finish()
    }
}

fn check_field(name: &str, value: &[u8]) -> Result<()> {
    if value.contains(&DELIMITER) {
        return Err(Error::MalformedMessage(format!("{name} contains a newline")));
    }
    Ok(())
}

fn split_field<'a>(buf: &'a [u8], name: &str) -> Result<(&'a [u8], &'a [u8])> {
    let pos = buf
        .iter()
        .position(|&b| b == DELIMITER)
        .ok_or_else(|| Error::MalformedMessage(format!("missing delimiter after {name}")))?;
    Ok((&buf[..pos], &buf[pos + 1..]))
}

/// One slice of file payload.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub is_final: bool,
    pub data: Bytes,
}

impl ChunkInfo {
    pub fn new(is_final: bool, data: impl Into<Bytes>) -> Self {
        Self {
            is_final,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.data.len());
        buf.put_u8(if self.is_final { FLAG_FINAL } else { FLAG_MORE });
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decodes a chunk.  Any non-zero flag byte counts as final.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if `buf` is empty.
    pub fn decode(buf: &Bytes) -> Result<Self> {
        let Some(&flag) = buf.first() else {
            return Err(Error::MalformedMessage("empty chunk".into()));
        };
        Ok(Self {
            is_final: flag != FLAG_MORE,
            data: buf.slice(1..),
        })
    }
}

impl fmt::Debug for ChunkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkInfo")
            .field("is_final", &self.is_final)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> MetaInfo {
        MetaInfo {
            password_hash: b"5e884898da28047151d0e56f8dc62927".to_vec(),
            file_name: "holiday photo.jpg".into(),
            file_size: 1_048_586,
            file_hash: b"9f86d081884c7d659a2feaa0c55ad015".to_vec(),
        }
    }

    #[test]
    fn given_meta_info_when_round_tripped_then_matches() {
        let meta = sample_meta();
        let decoded = MetaInfo::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn given_meta_info_when_encoded_then_layout_is_delimited_fields() {
        let meta = MetaInfo {
            password_hash: b"pw".to_vec(),
            file_name: "a.txt".into(),
            file_size: 10,
            file_hash: b"fh".to_vec(),
        };
        let encoded = meta.encode().unwrap();
        assert_eq!(&encoded[..], b"pw\na.txt\n\x00\x00\x00\x00\x00\x00\x00\x0a\nfh\n");
    }

    /// The size field is taken by length, so a size whose bytes contain the
    /// delimiter still decodes.
    #[test]
    fn given_size_containing_newline_byte_when_round_tripped_then_matches() {
        let meta = MetaInfo {
            file_size: 0x0A0A_0A0A_0A0A_0A0A,
            ..sample_meta()
        };
        let decoded = MetaInfo::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded.file_size, 0x0A0A_0A0A_0A0A_0A0A);
    }

    #[test]
    fn given_empty_file_hash_and_zero_size_when_round_tripped_then_matches() {
        let meta = MetaInfo {
            file_size: 0,
            file_hash: Vec::new(),
            ..sample_meta()
        };
        assert_eq!(MetaInfo::decode(&meta.encode().unwrap()).unwrap(), meta);
    }

    #[test]
    fn given_file_name_with_newline_when_encoded_then_rejected() {
        let meta = MetaInfo {
            file_name: "evil\nname".into(),
            ..sample_meta()
        };
        let err = meta.encode().unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(ref m) if m.contains("file name")));
    }

    #[test]
    fn given_empty_password_hash_when_encoded_then_rejected() {
        let meta = MetaInfo {
            password_hash: Vec::new(),
            ..sample_meta()
        };
        assert!(matches!(meta.encode(), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn given_empty_password_hash_when_decoded_then_malformed() {
        let err = MetaInfo::decode(b"\na.txt\n\x00\x00\x00\x00\x00\x00\x00\x0a\nfh\n").unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(ref m) if m.contains("password hash")));
    }

    #[test]
    fn given_missing_delimiter_when_decoded_then_malformed() {
        let err = MetaInfo::decode(b"only-a-password-hash").unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(ref m) if m.contains("password hash")));
    }

    #[test]
    fn given_short_size_field_when_decoded_then_malformed() {
        let err = MetaInfo::decode(b"pw\na.txt\n\x00\x00\x0a\nfh\n").unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(ref m) if m.contains("8 bytes")));
    }

    #[test]
    fn given_missing_final_delimiter_when_decoded_then_malformed() {
        let mut encoded = sample_meta().encode().unwrap().to_vec();
        encoded.pop();
        assert!(matches!(
            MetaInfo::decode(&encoded),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn given_trailing_garbage_when_decoded_then_malformed() {
        let mut encoded = sample_meta().encode().unwrap().to_vec();
        encoded.extend_from_slice(b"junk");
        assert!(MetaInfo::decode(&encoded).is_err());
    }

    #[test]
    fn given_chunk_with_data_when_round_tripped_then_matches() {
        let chunk = ChunkInfo::new(false, &b"\x00\x01\n\xff"[..]);
        let decoded = ChunkInfo::decode(&chunk.encode()).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn given_final_empty_chunk_when_round_tripped_then_matches() {
        let chunk = ChunkInfo::new(true, Bytes::new());
        let encoded = chunk.encode();
        assert_eq!(&encoded[..], &[0x01]);
        assert_eq!(ChunkInfo::decode(&encoded).unwrap(), chunk);
    }

    #[test]
    fn given_empty_buffer_when_decoding_chunk_then_malformed() {
        assert!(matches!(
            ChunkInfo::decode(&Bytes::new()),
            Err(Error::MalformedMessage(_))
        ));
    }
}
