//! The cheap tier of the control plane. Runs from cron every ~15 minutes as
//! a fresh process, reads location and online state, and only invokes the
//! expensive worker when something actionable changed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::snapshot::{LocationStatus, VehicleSnapshot};
use crate::store::{ScoutState, SecretStore, SessionStatus, StateStore};
use crate::tesla::{ApiError, Gateway, TokenRecord, TokenSource, VehicleApi};

/// Minimum spacing between refresh escalations to the worker. The cron
/// cadence dwarfs this across invocations; the floor protects the retry
/// paths inside a single invocation. An already-expired token bypasses it.
const REFRESH_FLOOR: Duration = Duration::from_secs(60);
const REFRESH_CALL_DEADLINE: Duration = Duration::from_secs(45);
const TRIGGER_CALL_DEADLINE: Duration = Duration::from_secs(60);
/// How long to give the worker to persist a fresh record before re-reading.
const REFRESH_SETTLE: Duration = Duration::from_secs(2);

/// Scout's token path: read the record directly, and when it is missing or
/// expiring ask the worker to refresh rather than refreshing here. Scout
/// must never consume a refresh token itself, or the chain forks.
pub struct ScoutTokens {
    secrets: Arc<dyn SecretStore>,
    client: reqwest::Client,
    worker_url: String,
    auth_token: String,
    last_attempt: tokio::sync::Mutex<Option<Instant>>,
}

impl ScoutTokens {
    pub fn new(secrets: Arc<dyn SecretStore>, worker_url: String, auth_token: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("offpeak-ev-charging")
            .timeout(REFRESH_CALL_DEADLINE)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        ScoutTokens {
            secrets,
            client,
            worker_url,
            auth_token,
            last_attempt: tokio::sync::Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<Option<TokenRecord>, ApiError> {
        self.secrets
            .load()
            .await
            .map_err(|e| ApiError::Transient(format!("loading token record: {}", e)))
    }

    /// Ask the worker to refresh, wait briefly, and re-read the record.
    async fn escalate(&self, emergency: bool) -> Result<String, ApiError> {
        {
            let mut last = self.last_attempt.lock().await;
            if !emergency {
                if let Some(at) = *last {
                    if at.elapsed() < REFRESH_FLOOR {
                        return Err(ApiError::RateLimited);
                    }
                }
            }
            *last = Some(Instant::now());
        }

        let path = if emergency {
            "/emergency-refresh-tokens"
        } else {
            "/refresh-tokens"
        };
        tracing::info!(path, "escalating token refresh to worker");

        let response = self
            .client
            .post(format!("{}{}", self.worker_url, path))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::classify(status, &body));
        }

        tokio::time::sleep(REFRESH_SETTLE).await;

        match self.load().await? {
            Some(record) => Ok(record.access_token),
            None => Err(ApiError::Transient(
                "token record still missing after worker refresh".to_string(),
            )),
        }
    }
}

#[async_trait]
impl TokenSource for ScoutTokens {
    async fn access_token(&self) -> Result<String, ApiError> {
        let record = self.load().await?;
        let now = Utc::now();

        if let Some(record) = &record {
            if record.valid_for(crate::broker::VALIDITY_FLOOR_MINUTES, now) {
                return Ok(record.access_token.clone());
            }
        }

        let emergency = record
            .as_ref()
            .map_or(true, |r| r.remaining(now) < ChronoDuration::seconds(60));

        match self.escalate(emergency).await {
            Ok(token) => Ok(token),
            Err(ApiError::RateLimited) => match record {
                // Expiring but still alive: limp along on the stale token.
                Some(r) if r.remaining(now) > ChronoDuration::zero() => {
                    tracing::warn!("refresh rate limited, using near-expiry token");
                    Ok(r.access_token)
                }
                _ => Err(ApiError::RateLimited),
            },
            Err(err) => Err(err),
        }
    }

    async fn refreshed_token(&self) -> Result<String, ApiError> {
        // A 401 means the token is bad regardless of its bookkeeping.
        self.escalate(true).await
    }
}

/// Why the worker is being invoked. The exact strings travel in the
/// run-cycle request body and in worker logs.
pub fn decide_trigger(
    previous: Option<&ScoutState>,
    current: &VehicleSnapshot,
    special_session_active: bool,
) -> Option<&'static str> {
    // A running special-charging session must not be perturbed.
    if special_session_active {
        return None;
    }

    let prev = match previous {
        None => return Some("init state"),
        Some(prev) => prev,
    };

    // An offline vehicle reports no GPS; it has not moved since last seen.
    let at_home = match current.location_status {
        LocationStatus::Unknown if !current.online => prev.at_home,
        _ => current.at_home(),
    };

    if !prev.at_home && current.at_home() {
        return Some("returned home");
    }

    if current.online
        && at_home
        && current.is_charging_ready
        && !(prev.online && prev.at_home && prev.is_charging_ready)
    {
        return Some("Condition A ready");
    }

    if prev.online && prev.at_home && !prev.is_charging_ready && !current.online && at_home {
        return Some("Condition B — vehicle OFFLINE, wake and re-check");
    }

    None
}

/// State writes cost money; only the online path and the online→offline
/// edge pay for one. Continuously-offline polls write nothing.
pub fn should_write(previous: Option<&ScoutState>, current: &VehicleSnapshot) -> bool {
    current.online || previous.map_or(false, |prev| prev.online)
}

#[derive(Serialize, Debug)]
pub struct SnapshotSummary {
    pub online: bool,
    pub at_home: bool,
    pub battery_percent: u32,
    pub is_charging_ready: bool,
    pub location: String,
}

impl SnapshotSummary {
    fn from_snapshot(snapshot: &VehicleSnapshot) -> Self {
        SnapshotSummary {
            online: snapshot.online,
            at_home: snapshot.at_home(),
            battery_percent: snapshot.battery_percent,
            is_charging_ready: snapshot.is_charging_ready,
            location: snapshot.location_status.to_string(),
        }
    }
}

/// What one invocation did, printed as JSON for the cron log.
#[derive(Serialize, Debug)]
pub struct ScoutReport {
    pub vin_tail: String,
    pub online: bool,
    pub at_home: bool,
    pub battery_percent: u32,
    pub is_charging_ready: bool,
    pub triggered: Option<String>,
    pub wrote_state: bool,
}

/// One full scout invocation: read, compare, maybe trigger, persist.
pub async fn run(
    config: &Config,
    store: Arc<dyn StateStore>,
    secrets: Arc<dyn SecretStore>,
) -> Result<ScoutReport> {
    let vin = config.charging.vin.clone();
    let previous = store.load_scout_state(&vin).await?;

    let tokens = Arc::new(ScoutTokens::new(
        secrets,
        config.worker.url.clone(),
        config.worker.auth_token.clone(),
    ));
    // Scout only reads; it never needs the signing proxy.
    let gateway = Gateway::connect(config.home.clone(), None, vin.clone(), tokens)
        .await
        .context("connecting to vehicle API")?;

    let snapshot = gateway
        .get_snapshot(true)
        .await
        .context("reading vehicle snapshot")?;

    let special_session_active = store
        .list_sessions()
        .await?
        .iter()
        .any(|s| s.vin == vin && s.status == SessionStatus::Active);

    let reason = decide_trigger(previous.as_ref(), &snapshot, special_session_active);

    if let Some(reason) = reason {
        if let Err(err) = trigger_worker(config, reason, &snapshot).await {
            // Single attempt by design; the next poll or the midnight wake
            // will catch up.
            tracing::warn!(error = %err, reason, "worker trigger failed");
        }
    }

    let wrote_state = should_write(previous.as_ref(), &snapshot);
    if wrote_state {
        let mut state = ScoutState::from_snapshot(&snapshot);
        if !snapshot.online {
            // The offline edge write carries no GPS; the vehicle has not
            // moved since it was last seen online.
            if let Some(prev) = &previous {
                state.latitude = prev.latitude;
                state.longitude = prev.longitude;
                state.at_home = prev.at_home;
            }
        }
        store.save_scout_state(&state).await?;
    }

    Ok(ScoutReport {
        vin_tail: snapshot.vin_tail().to_string(),
        online: snapshot.online,
        at_home: snapshot.at_home(),
        battery_percent: snapshot.battery_percent,
        is_charging_ready: snapshot.is_charging_ready,
        triggered: reason.map(String::from),
        wrote_state,
    })
}

async fn trigger_worker(config: &Config, reason: &str, snapshot: &VehicleSnapshot) -> Result<()> {
    #[derive(Serialize)]
    struct RunCycleRequest<'a> {
        reason: &'a str,
        snapshot_summary: SnapshotSummary,
    }

    tracing::info!(reason, "invoking worker");
    let client = reqwest::Client::builder()
        .user_agent("offpeak-ev-charging")
        .timeout(TRIGGER_CALL_DEADLINE)
        .build()
        .expect("reqwest client construction cannot fail with static options");

    client
        .post(format!("{}/run-cycle", config.worker.url))
        .bearer_auth(&config.worker.auth_token)
        .json(&RunCycleRequest {
            reason,
            snapshot_summary: SnapshotSummary::from_snapshot(snapshot),
        })
        .send()
        .await
        .context("reaching worker")?
        .error_for_status()
        .context("worker run-cycle")?;
    Ok(())
}
