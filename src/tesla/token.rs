use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiError, AUTH_URL};
use crate::config;

/// The persisted OAuth state. The issuer treats refresh tokens as single-use
/// (with a short grace window), so there must only ever be one writer of this
/// record: the broker inside the worker process.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub obtained_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Whether the access token is still usable with a margin of safety.
    pub fn valid_for(&self, minutes: i64, now: DateTime<Utc>) -> bool {
        self.remaining(now) >= Duration::minutes(minutes)
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

/// Exchange the stored refresh token for a fresh token pair.
///
/// A 4xx answer from the issuer means the chain is gone (consumed twice or
/// revoked) and no amount of retrying will bring it back.
#[tracing::instrument(skip(client, oauth, refresh_token))]
pub async fn refresh_token_grant(
    client: &reqwest::Client,
    oauth: &config::OAuth,
    refresh_token: &str,
) -> Result<TokenRecord, ApiError> {
    let request = RefreshRequest {
        grant_type: "refresh_token",
        client_id: &oauth.client_id,
        client_secret: &oauth.client_secret,
        refresh_token,
    };

    let response = client.post(AUTH_URL).form(&request).send().await?;

    let status = response.status();
    if status.is_client_error() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(%status, body, "token refresh rejected by issuer");
        return Err(ApiError::NeedsReauthorization);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::classify(status, &body));
    }

    let parsed = response
        .json::<RefreshResponse>()
        .await
        .map_err(|e| ApiError::Transient(format!("malformed token response: {}", e)))?;

    let now = Utc::now();
    Ok(TokenRecord {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at: now + Duration::seconds(parsed.expires_in),
        obtained_at: now,
    })
}
