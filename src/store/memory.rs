use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ActiveCase, ScoutState, Session, StateStore};

/// In-memory store for tests and local experiments.
#[derive(Default)]
pub struct MemoryStore {
    scout_state: RwLock<HashMap<String, ScoutState>>,
    cases: RwLock<HashMap<String, ActiveCase>>,
    sessions: RwLock<HashMap<String, Session>>,
    fingerprints: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_scout_state(&self, vin: &str) -> Result<Option<ScoutState>> {
        Ok(self.scout_state.read().await.get(vin).cloned())
    }

    async fn save_scout_state(&self, state: &ScoutState) -> Result<()> {
        self.scout_state
            .write()
            .await
            .insert(state.vin.clone(), state.clone());
        Ok(())
    }

    async fn load_active_case(&self, vin: &str) -> Result<Option<ActiveCase>> {
        Ok(self.cases.read().await.get(vin).cloned())
    }

    async fn save_active_case(&self, case: &ActiveCase) -> Result<()> {
        self.cases
            .write()
            .await
            .insert(case.vin.clone(), case.clone());
        Ok(())
    }

    async fn clear_active_case(&self, vin: &str) -> Result<()> {
        self.cases.write().await.remove(vin);
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn load_fingerprint(&self, vin: &str) -> Result<Option<String>> {
        Ok(self.fingerprints.read().await.get(vin).cloned())
    }

    async fn save_fingerprint(&self, vin: &str, fingerprint: &str) -> Result<()> {
        self.fingerprints
            .write()
            .await
            .insert(vin.to_string(), fingerprint.to_string());
        Ok(())
    }
}
