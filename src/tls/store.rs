//! Persistent certificate cache.
//!
//! One record per domain, stored as JSON under the cache directory. Records are
//! written to a temporary file, flushed and renamed into place, so a record is
//! either fully present or absent after a crash.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Certificate material for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub domain: String,
    /// Leaf certificate followed by intermediates, PEM encoded
    pub cert_chain_pem: String,
    /// Private key for the leaf, PEM encoded
    pub private_key_pem: String,
    pub not_after: DateTime<Utc>,
}

impl CertificateRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }

    /// True while the certificate is outside its renewal window.
    pub fn is_fresh(&self, now: DateTime<Utc>, renew_before: chrono::Duration) -> bool {
        self.not_after - renew_before > now
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("certificate cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt certificate record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode certificate record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Storage for certificate records keyed by domain.
#[async_trait]
pub trait CertStore: Send + Sync {
    /// Load the record for `domain`, `None` when nothing is cached.
    async fn load(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError>;

    /// Replace the record for `record.domain`.
    async fn save(&self, record: &CertificateRecord) -> Result<(), StoreError>;
}

/// Directory-backed store, one `<domain>.json` file per record.
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{domain}.json"))
    }
}

#[async_trait]
impl CertStore for DirStore {
    async fn load(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
        let path = self.record_path(domain);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = serde_json::from_slice(&contents)
            .map_err(|source| StoreError::Corrupt { path, source })?;
        Ok(Some(record))
    }

    async fn save(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let encoded = serde_json::to_vec_pretty(record)?;
        let path = self.record_path(&record.domain);
        let tmp_path = self
            .dir
            .join(format!(".{}.{}.tmp", record.domain, uuid::Uuid::new_v4()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        // Records carry the private key
        #[cfg(unix)]
        options.mode(0o600);

        let write = async {
            let mut file = options.open(&tmp_path).await?;
            file.write_all(&encoded).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        tracing::debug!(domain = %record.domain, path = %path.display(), "Certificate record written");
        Ok(())
    }
}
