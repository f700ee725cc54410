use reqwest::StatusCode;
use thiserror::Error;

/// Domain classification of everything that can go wrong talking to the
/// vehicle cloud, the signing proxy, or the OAuth issuer.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("unauthorized (401)")]
    Unauthorized,
    #[error("forbidden (403): {0}")]
    Forbidden(String),
    #[error("not supported by this vehicle or firmware: {0}")]
    NotSupported(String),
    #[error("rate limited (429)")]
    RateLimited,
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("vehicle did not come online before the wake deadline")]
    WakeTimeout,
    #[error("refresh token chain is broken; re-authorization required")]
    NeedsReauthorization,
}

impl ApiError {
    /// Map an HTTP status + response body onto the domain taxonomy.
    pub fn classify(status: StatusCode, body: &str) -> ApiError {
        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::FORBIDDEN => ApiError::Forbidden(truncate(body)),
            StatusCode::PRECONDITION_FAILED if body.to_ascii_lowercase().contains("not supported") => {
                ApiError::NotSupported(truncate(body))
            }
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            // The cloud answers 408 for a vehicle that is asleep or out of
            // coverage; that is a vehicle condition, not a caller bug.
            StatusCode::REQUEST_TIMEOUT => {
                ApiError::Transient(format!("408 vehicle unavailable: {}", truncate(body)))
            }
            s if s.is_server_error() => ApiError::Transient(format!("{}: {}", s, truncate(body))),
            s if s.is_client_error() => ApiError::BadRequest(format!("{}: {}", s, truncate(body))),
            s => ApiError::Transient(format!("unexpected status {}", s)),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ApiError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::classify(status, &err.to_string())
        } else {
            ApiError::Transient(err.to_string())
        }
    }
}

// Response bodies can carry full HTML error pages; keep logs readable.
fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(matches!(
            ApiError::classify(StatusCode::UNAUTHORIZED, ""),
            ApiError::Unauthorized
        ));
        assert!(matches!(
            ApiError::classify(StatusCode::FORBIDDEN, "missing scope"),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            ApiError::classify(StatusCode::PRECONDITION_FAILED, "command not supported"),
            ApiError::NotSupported(_)
        ));
        assert!(matches!(
            ApiError::classify(StatusCode::PRECONDITION_FAILED, "some other precondition"),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::classify(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::classify(StatusCode::BAD_GATEWAY, "upstream"),
            ApiError::Transient(_)
        ));
        assert!(matches!(
            ApiError::classify(StatusCode::UNPROCESSABLE_ENTITY, "bad body"),
            ApiError::BadRequest(_)
        ));
    }
}
