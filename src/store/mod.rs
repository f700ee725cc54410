//! Persisted control-plane state. Each collection has exactly one writer:
//! scout owns its state, the worker owns cases, sessions and fingerprints.

mod file;
mod memory;
mod secret;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::{ChargingState, VehicleSnapshot};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use secret::{FileSecretStore, MemorySecretStore, SecretStore};

/// What scout remembers between invocations. Rewritten on every online read,
/// once more on the online→offline edge, and never while offline after that.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ScoutState {
    pub vin: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub at_home: bool,
    pub online: bool,
    pub battery_percent: u32,
    pub charging_state: ChargingState,
    pub is_charging_ready: bool,
    pub timestamp: DateTime<Utc>,
}

impl ScoutState {
    pub fn from_snapshot(snapshot: &VehicleSnapshot) -> Self {
        ScoutState {
            vin: snapshot.vin.clone(),
            latitude: snapshot.latitude,
            longitude: snapshot.longitude,
            at_home: snapshot.at_home(),
            online: snapshot.online,
            battery_percent: snapshot.battery_percent,
            charging_state: snapshot.charging_state,
            is_charging_ready: snapshot.is_charging_ready,
            timestamp: snapshot.read_timestamp,
        }
    }
}

/// Open Condition B monitoring: the vehicle was seen home, online and not
/// ready to charge. Cleared once it becomes ready or a wake re-check ran.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ActiveCase {
    pub vin: String,
    pub start_timestamp: DateTime<Utc>,
    pub last_battery: u32,
    pub last_ready: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Scheduled,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Forward-only lifecycle: SCHEDULED → ACTIVE → COMPLETED, with FAILED
    /// and CANCELLED reachable from any non-terminal state.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Scheduled, SessionStatus::Active) => true,
            (SessionStatus::Active, SessionStatus::Completed) => true,
            (from, SessionStatus::Failed | SessionStatus::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Scheduled => write!(f, "SCHEDULED"),
            SessionStatus::Active => write!(f, "ACTIVE"),
            SessionStatus::Completed => write!(f, "COMPLETED"),
            SessionStatus::Failed => write!(f, "FAILED"),
            SessionStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One ad-hoc "reach X% by T" charging plan and its two one-shot jobs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub vin: String,
    pub target_percent: u32,
    pub target_datetime: DateTime<Utc>,
    pub planned_charge_start: DateTime<Utc>,
    pub planned_charge_end: DateTime<Utc>,
    pub send_at: DateTime<Utc>,
    pub original_charge_limit: Option<u32>,
    pub send_job_name: String,
    pub cleanup_job_name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn transition(&mut self, next: SessionStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(anyhow!(
                "session {} cannot move {} → {}",
                self.session_id,
                self.status,
                next
            ));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// The document store behind scout and worker. Keys are VINs except for
/// sessions, which are keyed by session id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_scout_state(&self, vin: &str) -> Result<Option<ScoutState>>;
    async fn save_scout_state(&self, state: &ScoutState) -> Result<()>;

    async fn load_active_case(&self, vin: &str) -> Result<Option<ActiveCase>>;
    async fn save_active_case(&self, case: &ActiveCase) -> Result<()>;
    async fn clear_active_case(&self, vin: &str) -> Result<()>;

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>>;
    async fn save_session(&self, session: &Session) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<Session>>;

    async fn load_fingerprint(&self, vin: &str) -> Result<Option<String>>;
    async fn save_fingerprint(&self, vin: &str, fingerprint: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn session() -> Session {
        let now = Utc::now();
        Session {
            session_id: "special_2_20250122_0700".to_string(),
            vin: "5YJ3E7EB0KF000000".to_string(),
            target_percent: 85,
            target_datetime: now,
            planned_charge_start: now,
            planned_charge_end: now,
            send_at: now,
            original_charge_limit: Some(80),
            send_job_name: "special-charging-special_2_20250122_0700".to_string(),
            cleanup_job_name: "special-cleanup-special_2_20250122_0700".to_string(),
            status: SessionStatus::Scheduled,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut s = session();
        let now = Utc::now();
        s.transition(SessionStatus::Active, now).unwrap();
        s.transition(SessionStatus::Completed, now).unwrap();
        assert!(s.status.is_terminal());
    }

    #[test]
    fn no_backward_transitions() {
        let mut s = session();
        let now = Utc::now();
        s.transition(SessionStatus::Active, now).unwrap();
        assert!(s.transition(SessionStatus::Scheduled, now).is_err());
        s.transition(SessionStatus::Completed, now).unwrap();
        assert!(s.transition(SessionStatus::Active, now).is_err());
        assert!(s.transition(SessionStatus::Failed, now).is_err());
    }

    #[test]
    fn cancel_from_any_live_state() {
        let now = Utc::now();
        let mut s = session();
        s.transition(SessionStatus::Cancelled, now).unwrap();

        let mut s = session();
        s.transition(SessionStatus::Active, now).unwrap();
        s.transition(SessionStatus::Failed, now).unwrap();
        assert!(s.transition(SessionStatus::Cancelled, now).is_err());
    }

    fn any_status() -> impl Strategy<Value = SessionStatus> {
        prop_oneof![
            Just(SessionStatus::Scheduled),
            Just(SessionStatus::Active),
            Just(SessionStatus::Completed),
            Just(SessionStatus::Failed),
            Just(SessionStatus::Cancelled),
        ]
    }

    proptest! {
        // Whatever sequence of transition attempts is made, the observed
        // states form a prefix of SCHEDULED → ACTIVE → COMPLETED, possibly
        // ending in FAILED or CANCELLED, and terminal states never move.
        #[test]
        fn observed_sequence_is_monotonic(attempts in prop::collection::vec(any_status(), 0..12)) {
            let now = Utc::now();
            let mut s = session();
            let mut observed = vec![s.status];

            for next in attempts {
                if s.transition(next, now).is_ok() {
                    observed.push(s.status);
                }
            }

            let rank = |status: SessionStatus| match status {
                SessionStatus::Scheduled => 0,
                SessionStatus::Active => 1,
                _ => 2,
            };
            for pair in observed.windows(2) {
                prop_assert!(rank(pair[0]) < rank(pair[1]));
            }
            let terminal_count = observed.iter().filter(|s| s.is_terminal()).count();
            prop_assert!(terminal_count <= 1);
        }
    }
}
