//! Streaming SHA-256 digests.
//!
//! Digests travel as lowercase hex so they can never contain the
//! [`MetaInfo`](crate::message::MetaInfo) field delimiter.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const BUF_SIZE: usize = 64 * 1024;

/// Incremental content digest, fed chunk by chunk on the receiving side.
#[derive(Default, Clone)]
pub struct ContentDigest {
    hasher: Sha256,
    len: u64,
}

impl ContentDigest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes fed so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowercase hex digest as bytes, ready for the wire.
    #[must_use]
    pub fn finalize_hex(self) -> Vec<u8> {
        hex::encode(self.hasher.finalize()).into_bytes()
    }
}

/// Digest of an entire file together with its length, streamed in 64 KiB
/// blocks.
///
/// # Errors
///
/// Returns any I/O error from opening or reading the file.
pub async fn digest_file(path: &Path) -> io::Result<(u64, Vec<u8>)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut digest = ContentDigest::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok((digest.len(), digest.finalize_hex()))
}

/// Hex digest of a shared secret, used as the `password_hash` field.
#[must_use]
pub fn hash_password(password: &str) -> Vec<u8> {
    let mut digest = ContentDigest::new();
    digest.update(password.as_bytes());
    digest.finalize_hex()
}
