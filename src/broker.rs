//! The single serialising point for refresh-token consumption. The issuer
//! treats refresh tokens as single-use; two concurrent refreshes fork the
//! chain and permanently invalidate it, so every refresh in this process
//! goes through one lock, and this process is the only writer anywhere.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::config;
use crate::store::SecretStore;
use crate::tesla::{refresh_token_grant, ApiError, TokenRecord, TokenSource};

/// Tokens with less than this many minutes remaining are refreshed before
/// being handed out.
pub const VALIDITY_FLOOR_MINUTES: i64 = 5;

#[async_trait]
trait RefreshBackend: Send + Sync {
    async fn refresh(
        &self,
        oauth: &config::OAuth,
        refresh_token: &str,
    ) -> Result<TokenRecord, ApiError>;
}

struct HttpRefresh {
    client: reqwest::Client,
}

#[async_trait]
impl RefreshBackend for HttpRefresh {
    async fn refresh(
        &self,
        oauth: &config::OAuth,
        refresh_token: &str,
    ) -> Result<TokenRecord, ApiError> {
        refresh_token_grant(&self.client, oauth, refresh_token).await
    }
}

pub struct TokenBroker {
    oauth: config::OAuth,
    secrets: Arc<dyn SecretStore>,
    backend: Box<dyn RefreshBackend>,
    refresh_lock: Mutex<()>,
}

impl TokenBroker {
    pub fn new(oauth: config::OAuth, secrets: Arc<dyn SecretStore>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("offpeak-ev-charging")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self::with_backend(oauth, secrets, Box::new(HttpRefresh { client }))
    }

    fn with_backend(
        oauth: config::OAuth,
        secrets: Arc<dyn SecretStore>,
        backend: Box<dyn RefreshBackend>,
    ) -> Self {
        TokenBroker {
            oauth,
            secrets,
            backend,
            refresh_lock: Mutex::new(()),
        }
    }

    /// A token valid for at least [`VALIDITY_FLOOR_MINUTES`] more minutes,
    /// refreshing if needed.
    pub async fn get_access_token(&self) -> Result<String, ApiError> {
        if let Some(record) = self.load().await? {
            if record.valid_for(VALIDITY_FLOOR_MINUTES, Utc::now()) {
                return Ok(record.access_token);
            }
        }

        let _guard = self.refresh_lock.lock().await;
        // A caller that held the lock before us may already have refreshed.
        if let Some(record) = self.load().await? {
            if record.valid_for(VALIDITY_FLOOR_MINUTES, Utc::now()) {
                return Ok(record.access_token);
            }
        }

        let record = self.refresh_locked("token expiring").await?;
        Ok(record.access_token)
    }

    /// Refresh regardless of cache age. Used by the worker refresh endpoints.
    pub async fn force_refresh(&self, reason: &str) -> Result<TokenRecord, ApiError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked(reason).await
    }

    /// Minutes of validity left on the stored token, for observability.
    pub async fn remaining_minutes(&self) -> Result<Option<i64>, ApiError> {
        Ok(self
            .load()
            .await?
            .map(|record| record.remaining(Utc::now()).num_minutes()))
    }

    async fn refresh_locked(&self, reason: &str) -> Result<TokenRecord, ApiError> {
        let current = self.load().await?.ok_or(ApiError::NeedsReauthorization)?;
        tracing::info!(reason, "refreshing access token");

        let mut result = self
            .backend
            .refresh(&self.oauth, &current.refresh_token)
            .await;
        if matches!(&result, Err(e) if e.is_transient()) {
            tracing::warn!("token refresh failed transiently, retrying once");
            tokio::time::sleep(Duration::from_secs(2)).await;
            result = self
                .backend
                .refresh(&self.oauth, &current.refresh_token)
                .await;
        }

        match result {
            Ok(record) => {
                // Persist before returning: a token the secret store has not
                // seen does not exist as far as scout is concerned.
                self.secrets
                    .save(&record)
                    .await
                    .map_err(|e| ApiError::Transient(format!("persisting token record: {}", e)))?;
                metrics::gauge!(
                    "token_remaining_minutes",
                    record.remaining(Utc::now()).num_minutes() as f64
                );
                Ok(record)
            }
            Err(ApiError::NeedsReauthorization) => {
                tracing::error!("refresh chain is broken, clearing stored record");
                let _ = self.secrets.clear().await;
                Err(ApiError::NeedsReauthorization)
            }
            Err(err) => Err(err),
        }
    }

    async fn load(&self) -> Result<Option<TokenRecord>, ApiError> {
        self.secrets
            .load()
            .await
            .map_err(|e| ApiError::Transient(format!("loading token record: {}", e)))
    }
}

#[async_trait]
impl TokenSource for TokenBroker {
    async fn access_token(&self) -> Result<String, ApiError> {
        self.get_access_token().await
    }

    async fn refreshed_token(&self) -> Result<String, ApiError> {
        Ok(self.force_refresh("unauthorized response").await?.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySecretStore;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingBackend {
        calls: Arc<AtomicU32>,
        fail_with: Option<ApiError>,
    }

    #[async_trait]
    impl RefreshBackend for CountingBackend {
        async fn refresh(
            &self,
            _oauth: &config::OAuth,
            refresh_token: &str,
        ) -> Result<TokenRecord, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let now = Utc::now();
            Ok(TokenRecord {
                access_token: format!("fresh-after-{}", refresh_token),
                refresh_token: "next".to_string(),
                expires_at: now + ChronoDuration::hours(8),
                obtained_at: now,
            })
        }
    }

    fn stale_record() -> TokenRecord {
        let now = Utc::now();
        TokenRecord {
            access_token: "stale".to_string(),
            refresh_token: "rt-1".to_string(),
            expires_at: now + ChronoDuration::seconds(30),
            obtained_at: now - ChronoDuration::hours(8),
        }
    }

    fn broker_with(
        record: TokenRecord,
        fail_with: Option<ApiError>,
    ) -> (Arc<TokenBroker>, Arc<AtomicU32>, Arc<MemorySecretStore>) {
        let calls = Arc::new(AtomicU32::new(0));
        let secrets = Arc::new(MemorySecretStore::with_record(record));
        let broker = Arc::new(TokenBroker::with_backend(
            config::OAuth::default(),
            secrets.clone(),
            Box::new(CountingBackend {
                calls: calls.clone(),
                fail_with,
            }),
        ));
        (broker, calls, secrets)
    }

    #[tokio::test]
    async fn valid_token_is_served_from_cache() {
        let mut record = stale_record();
        record.expires_at = Utc::now() + ChronoDuration::hours(2);
        let (broker, calls, _) = broker_with(record, None);

        let token = broker.get_access_token().await.unwrap();
        assert_eq!(token, "stale");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_expiry_refreshes_once() {
        let (broker, calls, _) = broker_with(stale_record(), None);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.get_access_token().await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "fresh-after-rt-1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_ignores_cache_age() {
        let mut record = stale_record();
        record.expires_at = Utc::now() + ChronoDuration::hours(2);
        let (broker, calls, secrets) = broker_with(record, None);

        broker.force_refresh("test").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = secrets.load().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh-after-rt-1");
    }

    #[tokio::test]
    async fn broken_chain_clears_record() {
        let (broker, _, secrets) =
            broker_with(stale_record(), Some(ApiError::NeedsReauthorization));

        let err = broker.get_access_token().await.unwrap_err();
        assert!(matches!(err, ApiError::NeedsReauthorization));
        assert!(secrets.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_record_needs_reauthorization() {
        let calls = Arc::new(AtomicU32::new(0));
        let broker = TokenBroker::with_backend(
            config::OAuth::default(),
            Arc::new(MemorySecretStore::new()),
            Box::new(CountingBackend {
                calls: calls.clone(),
                fail_with: None,
            }),
        );

        let err = broker.get_access_token().await.unwrap_err();
        assert!(matches!(err, ApiError::NeedsReauthorization));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
