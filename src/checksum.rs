//! SHA-256 content checksums
//!
//! Format: `sha256:<64 lowercase hex chars>`. Equality is exact string
//! comparison. Files are hashed in 8 KiB chunks; in-memory buffers in one pass.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::{VaultError, VaultResult};

/// Prefix carried by every checksum string.
pub const CHECKSUM_PREFIX: &str = "sha256:";

const CHUNK_SIZE: usize = 8192;

/// Checksum of an in-memory buffer.
pub fn compute_checksum(data: &[u8]) -> String {
    format_digest(Sha256::digest(data).as_slice())
}

/// Checksum of a file, streamed in fixed-size chunks.
///
/// # Errors
///
/// `Validation` if the file does not exist, `Database` for other I/O failures.
pub fn compute_file_checksum(path: &Path) -> VaultResult<String> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            VaultError::Validation(format!("file not found: {}", path.display()))
        } else {
            VaultError::database(format!("cannot open {}", path.display()), e)
        }
    })?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| VaultError::database(format!("cannot read {}", path.display()), e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format_digest(hasher.finalize().as_slice()))
}

fn format_digest(digest: &[u8]) -> String {
    let mut out = String::with_capacity(CHECKSUM_PREFIX.len() + digest.len() * 2);
    out.push_str(CHECKSUM_PREFIX);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_known_vector() {
        assert_eq!(
            compute_checksum(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(
            compute_checksum(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_matches_memory_across_chunks() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("large.sql");

        // Larger than one chunk and not a multiple of it.
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let mut file = File::create(&path).unwrap();
        file.write_all(&data).unwrap();
        drop(file);

        assert_eq!(compute_file_checksum(&path).unwrap(), compute_checksum(&data));
    }

    #[test]
    fn test_missing_file_is_validation_error() {
        let result = compute_file_checksum(Path::new("/nonexistent/docvault/file.sql"));
        assert!(matches!(result, Err(VaultError::Validation(_))));
    }

    #[test]
    fn test_format_prefix_and_length() {
        let sum = compute_checksum(b"x");
        assert!(sum.starts_with(CHECKSUM_PREFIX));
        assert_eq!(sum.len(), CHECKSUM_PREFIX.len() + 64);
    }
}
