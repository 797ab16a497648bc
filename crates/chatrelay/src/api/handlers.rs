//! API request handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use tracing::instrument;

use crate::relay::RelayPhase;
use crate::session::SessionInfo;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Longest accepted session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: bool,
    pub active_sessions: usize,
}

/// Session state plus the relay's current phase.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub phase: RelayPhase,
}

/// Reject ids that are empty, too long, or contain characters outside
/// `[A-Za-z0-9_.:-]`.
pub fn validate_session_id(session_id: &str) -> ApiResult<()> {
    if session_id.is_empty() {
        return Err(ApiError::bad_request("session id must not be empty"));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(ApiError::bad_request(format!(
            "session id exceeds {} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if let Some(c) = session_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')))
    {
        return Err(ApiError::bad_request(format!(
            "session id contains invalid character {:?}",
            c
        )));
    }
    Ok(())
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = state.db.is_healthy().await;
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if database { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database,
            active_sessions: state.hub.active_sessions().len(),
        }),
    )
}

/// Inspect a session, hydrating it if no relay holds it yet.
#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    validate_session_id(&session_id)?;

    let relay = state.hub.relay(&session_id);
    let info = relay.inspect().await?;

    Ok(Json(SessionResponse {
        info,
        phase: relay.phase(),
    }))
}
