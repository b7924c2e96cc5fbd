use digest::Digest;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::{fmt, str::FromStr};
use tokio::io::{self as async_io, AsyncRead, AsyncReadExt};

use crate::error::MdlError;

/// Block size used when hashing files, independent of the network block size.
pub const HASH_BLOCK_SIZE: usize = 8192;

/// Digest algorithms a manifest may declare for its checksums.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    async fn hash_async_reader<D: Digest + Default>(
        mut reader: impl AsyncRead + Unpin,
    ) -> async_io::Result<D> {
        let mut hasher = D::default();
        let mut buf = vec![0u8; HASH_BLOCK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher)
    }

    /// Lowercase hex digest of everything `reader` yields.
    pub async fn hex_digest<R: AsyncRead + Unpin>(&self, reader: R) -> async_io::Result<String> {
        match self {
            HashAlgorithm::Md5 => {
                let hasher = Self::hash_async_reader::<Md5>(reader).await?;
                Ok(format!("{:x}", hasher.finalize()))
            }
            HashAlgorithm::Sha1 => {
                let hasher = Self::hash_async_reader::<Sha1>(reader).await?;
                Ok(format!("{:x}", hasher.finalize()))
            }
            HashAlgorithm::Sha256 => {
                let hasher = Self::hash_async_reader::<Sha256>(reader).await?;
                Ok(format!("{:x}", hasher.finalize()))
            }
            HashAlgorithm::Sha512 => {
                let hasher = Self::hash_async_reader::<Sha512>(reader).await?;
                Ok(format!("{:x}", hasher.finalize()))
            }
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        };
        f.write_str(s)
    }
}

impl FromStr for HashAlgorithm {
    type Err = MdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(MdlError::Config {
                message: format!("Unknown checksum algorithm '{}'", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn hex(algo: HashAlgorithm, data: &[u8]) -> String {
        algo.hex_digest(data).await.unwrap()
    }

    #[tokio::test]
    async fn test_md5_hex() {
        assert_eq!(
            hex(HashAlgorithm::Md5, b"hello world").await,
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[tokio::test]
    async fn test_md5_empty() {
        assert_eq!(
            hex(HashAlgorithm::Md5, b"").await,
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[tokio::test]
    async fn test_sha1_hex() {
        assert_eq!(
            hex(HashAlgorithm::Sha1, b"hello world").await,
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
    }

    #[tokio::test]
    async fn test_sha256_hex() {
        assert_eq!(
            hex(HashAlgorithm::Sha256, b"hello world").await,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_sha512_larger_than_block() {
        let data = vec![b'a'; HASH_BLOCK_SIZE * 3 + 17];
        let digest = hex(HashAlgorithm::Sha512, &data).await;
        assert_eq!(digest.len(), 128);
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("MD5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert_eq!(
            "sha-256".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha256
        );
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }
}
