//! Content hashing for sync operations.
//!
//! Uploads are fingerprinted with SHA-256; the hex digest is written into
//! the object metadata under `hash_sha256`.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

const BUFFER_SIZE: usize = 64 * 1024;

/// A computed file hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHash {
    /// Lowercase hex SHA-256 digest.
    pub value: String,
    /// Number of bytes hashed.
    pub size: u64,
}

/// Hash bytes with SHA-256.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hash everything `reader` yields, 64 KiB at a time.
pub async fn hash_reader<R>(reader: &mut R) -> std::io::Result<FileHash>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(FileHash {
        value: format!("{:x}", hasher.finalize()),
        size,
    })
}
