//! Long-term identity keys and hashing helpers.
//!
//! This module covers everything that outlives a single chat session: the
//! Ed25519 identity, the contact keyring and the content hashes used for
//! message ids and file integrity.

pub mod identity;
pub mod keyring;

pub use identity::*;
pub use keyring::*;

use crate::utils::Result;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Lowercase hex SHA-256 of `data`
pub fn hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase hex SHA-256 of a file's contents, streamed
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_hash_file_matches_hash() {
        let mut file = NamedTempFile::new().unwrap();
        let data = vec![7u8; 200_000];
        file.write_all(&data).unwrap();

        assert_eq!(hash_file(file.path()).await.unwrap(), hash(&data));
    }

    #[test]
    fn test_hash_known_vector() {
        assert_eq!(
            hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
