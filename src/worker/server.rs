//! HTTP surface of the worker. Scout, cron and the dynamic scheduler are
//! the only callers; everything except the health probe requires the shared
//! bearer secret.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::cycle::run_cycle;
use super::dispatch::{
    cleanup_single_session, send_special_schedule, CleanupOutcome, DispatchOutcome,
};
use super::planner::run_daily_check;
use super::WorkerContext;
use crate::tesla::ApiError;

pub fn router(ctx: Arc<WorkerContext>) -> Router {
    let protected = Router::new()
        .route("/get-token", get(get_token))
        .route("/refresh-tokens", post(refresh_tokens))
        .route("/emergency-refresh-tokens", post(emergency_refresh_tokens))
        .route("/run-cycle", post(run_cycle_handler))
        .route("/run-midnight-wake", post(run_midnight_wake))
        .route("/daily-special-charging-check", post(daily_check))
        .route("/send-special-schedule", post(send_schedule))
        .route("/cleanup-single-session", post(cleanup_session))
        .route_layer(middleware::from_fn_with_state(
            ctx.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

pub async fn serve(ctx: Arc<WorkerContext>) -> anyhow::Result<()> {
    let addr = ctx.config.worker.bind.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "worker listening");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// The platform fronts this service with identity-token authentication; at
/// this layer a shared bearer secret separates callers from the internet.
async fn require_bearer(
    State(ctx): State<Arc<WorkerContext>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match bearer {
        None => Err(StatusCode::UNAUTHORIZED),
        Some(token) if token == ctx.config.worker.auth_token => Ok(next.run(request).await),
        Some(_) => Err(StatusCode::FORBIDDEN),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    remaining_minutes: i64,
}

async fn get_token(
    State(ctx): State<Arc<WorkerContext>>,
) -> Result<Json<TokenResponse>, (StatusCode, String)> {
    let access_token = ctx.broker.get_access_token().await.map_err(api_error)?;
    let remaining_minutes = ctx
        .broker
        .remaining_minutes()
        .await
        .map_err(api_error)?
        .unwrap_or(0);
    Ok(Json(TokenResponse {
        access_token,
        remaining_minutes,
    }))
}

#[derive(Serialize)]
struct RefreshResponse {
    refreshed: bool,
    remaining_minutes: i64,
}

async fn refresh_tokens(
    State(ctx): State<Arc<WorkerContext>>,
) -> Result<Json<RefreshResponse>, (StatusCode, String)> {
    force_refresh(&ctx, "scout refresh request").await
}

/// Same operation as /refresh-tokens; the separate route exists so expired
/// tokens stand out in the logs.
async fn emergency_refresh_tokens(
    State(ctx): State<Arc<WorkerContext>>,
) -> Result<Json<RefreshResponse>, (StatusCode, String)> {
    force_refresh(&ctx, "scout EMERGENCY refresh request").await
}

async fn force_refresh(
    ctx: &WorkerContext,
    reason: &str,
) -> Result<Json<RefreshResponse>, (StatusCode, String)> {
    let record = ctx.broker.force_refresh(reason).await.map_err(api_error)?;
    Ok(Json(RefreshResponse {
        refreshed: true,
        remaining_minutes: record.remaining(chrono::Utc::now()).num_minutes(),
    }))
}

#[derive(Deserialize, Default)]
struct RunCycleRequest {
    reason: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    snapshot_summary: Option<serde_json::Value>,
}

async fn run_cycle_handler(
    State(ctx): State<Arc<WorkerContext>>,
    body: Option<Json<RunCycleRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let reason = request.reason.as_deref().unwrap_or("manual");
    Json(run_cycle(&ctx, reason, false).await)
}

async fn run_midnight_wake(State(ctx): State<Arc<WorkerContext>>) -> impl IntoResponse {
    Json(run_cycle(&ctx, "midnight wake", true).await)
}

async fn daily_check(
    State(ctx): State<Arc<WorkerContext>>,
) -> Result<Json<super::planner::PlannerOutcome>, (StatusCode, String)> {
    run_daily_check(&ctx).await.map(Json).map_err(internal_error)
}

#[derive(Deserialize)]
struct SessionRef {
    session_id: String,
}

async fn send_schedule(
    State(ctx): State<Arc<WorkerContext>>,
    Json(body): Json<SessionRef>,
) -> Result<Response, (StatusCode, String)> {
    match send_special_schedule(&ctx, &body.session_id)
        .await
        .map_err(internal_error)?
    {
        DispatchOutcome::NotFound => Ok((StatusCode::NOT_FOUND, "unknown session").into_response()),
        outcome => Ok(Json(outcome).into_response()),
    }
}

async fn cleanup_session(
    State(ctx): State<Arc<WorkerContext>>,
    Json(body): Json<SessionRef>,
) -> Result<Response, (StatusCode, String)> {
    match cleanup_single_session(&ctx, &body.session_id)
        .await
        .map_err(internal_error)?
    {
        CleanupOutcome::NotFound => Ok((StatusCode::NOT_FOUND, "unknown session").into_response()),
        outcome => Ok(Json(outcome).into_response()),
    }
}

fn api_error(err: ApiError) -> (StatusCode, String) {
    let status = match err {
        ApiError::NeedsReauthorization => StatusCode::SERVICE_UNAVAILABLE,
        ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string())
}

fn internal_error(err: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::{harness_with, FakeVehicle};
    use axum::body::Body;
    use tower::util::ServiceExt;

    fn request(method: &str, uri: &str, bearer: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let h = harness_with(FakeVehicle::default());
        let app = router(Arc::new(h.ctx));

        let response = app
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mutating_routes_reject_missing_and_wrong_bearers() {
        let h = harness_with(FakeVehicle::default());
        let app = router(Arc::new(h.ctx));

        let response = app
            .clone()
            .oneshot(request("POST", "/run-cycle", None, Some("{}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(request("POST", "/run-cycle", Some("wrong"), Some("{}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_session_is_a_404() {
        let h = harness_with(FakeVehicle::default());
        let token = h.ctx.config.worker.auth_token.clone();
        let app = router(Arc::new(h.ctx));

        let response = app
            .oneshot(request(
                "POST",
                "/send-special-schedule",
                Some(&token),
                Some(r#"{"session_id": "special_9_20250101_0000"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_token_surfaces_missing_chain() {
        let h = harness_with(FakeVehicle::default());
        let token = h.ctx.config.worker.auth_token.clone();
        let app = router(Arc::new(h.ctx));

        // No token record exists in the empty secret store.
        let response = app
            .oneshot(request("GET", "/get-token", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
