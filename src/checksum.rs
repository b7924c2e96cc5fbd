use std::{io, path::Path};

use tokio::io::BufReader;

use crate::hash::HashAlgorithm;

/// Compares a file on disk against an expected hex digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumValidator {
    algorithm: HashAlgorithm,
}

impl ChecksumValidator {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Streams the file through the configured digest. Hex comparison is case
    /// insensitive and ignores surrounding whitespace in `expected`.
    pub async fn verify<P: AsRef<Path>>(&self, file_path: P, expected: &str) -> io::Result<bool> {
        let file_path = file_path.as_ref();
        let file = tokio::fs::File::open(file_path).await?;
        let actual = self.algorithm.hex_digest(BufReader::new(file)).await?;
        let valid = actual.eq_ignore_ascii_case(expected.trim());
        tracing::debug!(
            "{} of {} is {}, expected {}: valid = {}",
            self.algorithm,
            file_path.display(),
            actual,
            expected,
            valid
        );
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_verify_matching_md5() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"hello world").await?;
        let validator = ChecksumValidator::default();
        assert!(validator.verify(&path, "5EB63BBBE01EEED093CB22BB8F5ACDC3").await?);
        assert!(!validator.verify(&path, "d41d8cd98f00b204e9800998ecf8427e").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_uses_configured_algorithm() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"hello world").await?;
        let validator = ChecksumValidator::new(HashAlgorithm::Sha256);
        assert!(
            validator
                .verify(
                    &path,
                    "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
                )
                .await?
        );
        assert!(!validator.verify(&path, "5eb63bbbe01eeed093cb22bb8f5acdc3").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = ChecksumValidator::default()
            .verify(dir.path().join("missing"), "abc")
            .await;
        assert!(result.is_err());
    }
}
