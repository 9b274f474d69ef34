//! Content fingerprints for deduplication.
//!
//! Strong fingerprints are `sha256:<hex>` over the file bytes. Sources that
//! are too large to hash cheaply at submission time, blobs, and files whose
//! metadata cannot be read get a weak fingerprint (`weak:<hex>`) derived from
//! path, size and mtime instead.

use std::path::Path;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::defaults;
use crate::error::Result;
use crate::models::SourceRef;

const STRONG_PREFIX: &str = "sha256:";
const WEAK_PREFIX: &str = "weak:";
const READ_BUF_BYTES: usize = 64 * 1024;

/// A dedup fingerprint with its strength flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub hash: String,
    pub weak: bool,
}

impl Fingerprint {
    pub fn strong(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            weak: false,
        }
    }

    pub fn weak(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            weak: true,
        }
    }
}

/// Fingerprint raw bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    format!("{STRONG_PREFIX}{}", hex::encode(Sha256::digest(bytes)))
}

/// Computes fingerprints for job sources.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    strong_max_bytes: u64,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(defaults::STRONG_HASH_MAX_BYTES)
    }
}

impl ContentHasher {
    pub fn new(strong_max_bytes: u64) -> Self {
        Self { strong_max_bytes }
    }

    pub async fn fingerprint(&self, source: &SourceRef) -> Result<Fingerprint> {
        match source {
            SourceRef::Path(path) => self.fingerprint_path(path).await,
            SourceRef::Blob { uri } => Ok(weak_fingerprint(&[uri.as_bytes()])),
        }
    }

    async fn fingerprint_path(&self, path: &Path) -> Result<Fingerprint> {
        let path_bytes = path.to_string_lossy();
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            // Unreadable sources still get a job; Extract reports the failure.
            _ => {
                tracing::debug!(path = %path.display(), "source metadata unavailable, weak fingerprint");
                return Ok(weak_fingerprint(&[path_bytes.as_bytes()]));
            }
        };

        if meta.len() > self.strong_max_bytes {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            return Ok(weak_fingerprint(&[
                path_bytes.as_bytes(),
                &meta.len().to_le_bytes(),
                &mtime.to_le_bytes(),
            ]));
        }

        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_BUF_BYTES];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Fingerprint::strong(format!(
            "{STRONG_PREFIX}{}",
            hex::encode(hasher.finalize())
        )))
    }
}

fn weak_fingerprint(parts: &[&[u8]]) -> Fingerprint {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    Fingerprint::weak(format!("{WEAK_PREFIX}{}", hex::encode(hasher.finalize())))
}
