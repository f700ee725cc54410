use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::{ActiveCase, ScoutState, Session, StateStore};

const SCOUT_STATE: &str = "scout_state";
const WORKER_CASES: &str = "worker_cases";
const SESSIONS: &str = "special_charging_sessions";
const FINGERPRINTS: &str = "fingerprints";

/// Document store as a directory tree: one subdirectory per collection, one
/// JSON file per key, replaced atomically via temp-file rename.
///
/// Scout and the worker are separate processes sharing this directory; the
/// ownership rules (each collection has a single writer) plus atomic
/// replacement are what make that safe without any locking.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: &Path) -> Result<Self> {
        for collection in [SCOUT_STATE, WORKER_CASES, SESSIONS, FINGERPRINTS] {
            std::fs::create_dir_all(root.join(collection))
                .with_context(|| format!("creating {}/{}", root.display(), collection))?;
        }
        Ok(FileStore {
            root: root.to_path_buf(),
        })
    }

    fn doc_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root.join(collection).join(format!("{}.json", key))
    }

    async fn read_doc<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        let path = self.doc_path(collection, key);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(
                serde_json::from_slice(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn write_doc<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
        let path = self.doc_path(collection, key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    async fn delete_doc(&self, collection: &str, key: &str) -> Result<()> {
        let path = self.doc_path(collection, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    async fn list_docs<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let dir = self.root.join(collection);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;

        let mut values = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            values.push(
                serde_json::from_slice(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?,
            );
        }
        Ok(values)
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn load_scout_state(&self, vin: &str) -> Result<Option<ScoutState>> {
        self.read_doc(SCOUT_STATE, vin).await
    }

    async fn save_scout_state(&self, state: &ScoutState) -> Result<()> {
        self.write_doc(SCOUT_STATE, &state.vin, state).await
    }

    async fn load_active_case(&self, vin: &str) -> Result<Option<ActiveCase>> {
        self.read_doc(WORKER_CASES, vin).await
    }

    async fn save_active_case(&self, case: &ActiveCase) -> Result<()> {
        self.write_doc(WORKER_CASES, &case.vin, case).await
    }

    async fn clear_active_case(&self, vin: &str) -> Result<()> {
        self.delete_doc(WORKER_CASES, vin).await
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.read_doc(SESSIONS, session_id).await
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        self.write_doc(SESSIONS, &session.session_id, session).await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.list_docs(SESSIONS).await?;
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn load_fingerprint(&self, vin: &str) -> Result<Option<String>> {
        self.read_doc(FINGERPRINTS, vin).await
    }

    async fn save_fingerprint(&self, vin: &str, fingerprint: &str) -> Result<()> {
        self.write_doc(FINGERPRINTS, vin, &fingerprint.to_string())
            .await
    }
}
