//! Checksums as recorded in the inventory.

use serde::{Deserialize, Serialize};
use crc32fast::Hasher as Crc32;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const SHA256: &str = "sha256";
pub const CRC32: &str = "crc32";

/// A hash value together with the name of the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub hash: String,
    pub algorithm: String,
}

impl Checksum {
    pub fn new(hash: impl Into<String>, algorithm: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            algorithm: algorithm.into(),
        }
    }

    pub fn sha256(hash: impl Into<String>) -> Self {
        Self::new(hash, SHA256)
    }

    /// A CRC-32 value as zero-padded lowercase hex.
    pub fn crc32(value: u32) -> Self {
        Self::new(format!("{value:08x}"), CRC32)
    }

    /// Whether [`Checksum::calc`] can recompute `algorithm`.
    pub fn is_supported(algorithm: &str) -> bool {
        matches!(algorithm, SHA256 | CRC32)
    }

    /// SHA-256 of an in-memory buffer.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self::sha256(hex::encode(Sha256::digest(data)))
    }

    /// Stream `reader` to its end, returning its SHA-256 and the byte count.
    pub async fn calc_sha256<R>(reader: &mut R) -> std::io::Result<(Self, u64)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((Self::sha256(hex::encode(hasher.finalize())), total))
    }

    /// Stream `reader` to its end, returning its CRC-32 and the byte count.
    pub async fn calc_crc32<R>(reader: &mut R) -> std::io::Result<(Self, u64)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut hasher = Crc32::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((Self::crc32(hasher.finalize()), total))
    }

    /// Recompute `algorithm` over `reader`. `None` if it is not supported.
    pub async fn calc<R>(algorithm: &str, reader: &mut R) -> std::io::Result<Option<(Self, u64)>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match algorithm {
            SHA256 => Self::calc_sha256(reader).await.map(Some),
            CRC32 => Self::calc_crc32(reader).await.map(Some),
            _ => Ok(None),
        }
    }
}
