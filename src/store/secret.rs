use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::tesla::TokenRecord;

/// Holds the single token record. The worker's broker is the only writer;
/// scout reads it directly. Replacement is a full-document swap.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenRecord>>;
    async fn save(&self, record: &TokenRecord) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// JSON file on local disk, replaced atomically via temp-file rename so a
/// concurrent reader never observes a half-written record.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: PathBuf) -> Self {
        FileSecretStore { path }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn load(&self) -> Result<Option<TokenRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => {
                let record = serde_json::from_slice(&raw)
                    .with_context(|| format!("parsing token record at {}", self.path.display()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn save(&self, record: &TokenRecord) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.path.display())),
        }
    }
}

/// Test double keeping the record in memory.
#[derive(Default)]
pub struct MemorySecretStore {
    inner: RwLock<Option<TokenRecord>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: TokenRecord) -> Self {
        MemorySecretStore {
            inner: RwLock::new(Some(record)),
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn load(&self) -> Result<Option<TokenRecord>> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, record: &TokenRecord) -> Result<()> {
        *self.inner.write().await = Some(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.write().await = None;
        Ok(())
    }
}
