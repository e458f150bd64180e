//! Control-plane REST API: pairing lifecycle and settings, JWT-scoped per
//! user.

use std::sync::{Arc, Mutex};

use axum::{
    Extension, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    middleware,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tbg_core::AgentId;
use tbg_security::{AuthedUser, SharedVerifier, require_bearer, with_request_id};
use tbg_session::{PAIRING_TTL, PairingTable};
use time::OffsetDateTime;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::registry::MappingRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<MappingRegistry>,
    pub pairing: Arc<Mutex<PairingTable>>,
    pub bot_username: String,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairRequest {
    agent_id: Option<String>,
    /// Legacy alias for `agentId`; first non-null wins.
    assistant_id: Option<String>,
    workspace_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PairResponse {
    pairing_code: String,
    bot_username: String,
    expires_in_seconds: i64,
    deep_link: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    paired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    telegram_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<AgentId>,
    pairing_pending: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsRequest {
    agent_id: Option<String>,
    assistant_id: Option<String>,
}

pub fn build_router(state: ApiState, verifier: SharedVerifier) -> Router {
    Router::new()
        .route("/pair", post(create_pairing).delete(delete_pairing))
        .route("/status", get(pairing_status))
        .route("/settings", put(update_settings))
        .layer(middleware::from_fn(require_bearer))
        .layer(Extension(verifier))
        .layer(middleware::from_fn(with_request_id))
        .layer(CorsLayer::permissive())
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn requested_agent(agent_id: Option<&str>, assistant_id: Option<&str>) -> Result<AgentId, String> {
    match agent_id.or(assistant_id) {
        Some(name) => {
            AgentId::from_alias(name).ok_or_else(|| format!("unknown agent: {name}"))
        }
        None => Ok(AgentId::default()),
    }
}

async fn create_pairing(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    headers: HeaderMap,
    body: Option<Json<PairRequest>>,
) -> Result<Json<PairResponse>, (StatusCode, Json<ApiError>)> {
    let Json(body) = body.unwrap_or_default();
    let agent = requested_agent(body.agent_id.as_deref(), body.assistant_id.as_deref())
        .map_err(|message| error_response(StatusCode::BAD_REQUEST, message))?;

    // The pairing code carries the caller's own bearer token so the bot can
    // hand it to the mapping at /start time.
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "missing bearer token"))?;

    let pending = state.pairing.lock().unwrap().issue(
        user_id.clone(),
        token,
        agent,
        body.workspace_id,
        OffsetDateTime::now_utc(),
    );
    info!(user_id = %user_id, "pairing code issued");

    Ok(Json(PairResponse {
        deep_link: format!(
            "https://t.me/{}?start={}",
            state.bot_username, pending.code
        ),
        pairing_code: pending.code,
        bot_username: state.bot_username.clone(),
        expires_in_seconds: PAIRING_TTL.whole_seconds(),
    }))
}

async fn delete_pairing(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    match state.registry.unpair_by_user(&user_id) {
        Ok(true) => {
            info!(user_id = %user_id, "pairing removed");
            Ok(StatusCode::OK)
        }
        Ok(false) => Err(error_response(StatusCode::NOT_FOUND, "not paired")),
        Err(err) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )),
    }
}

async fn pairing_status(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
) -> Json<StatusResponse> {
    let pending = state
        .pairing
        .lock()
        .unwrap()
        .pending_for_user(&user_id)
        .is_some();
    match state.registry.get_by_user(&user_id) {
        Some(entry) => Json(StatusResponse {
            paired: true,
            telegram_username: entry.record.telegram_username.clone(),
            agent_id: Some(entry.record.agent_id),
            pairing_pending: pending,
        }),
        None => Json(StatusResponse {
            paired: false,
            telegram_username: None,
            agent_id: None,
            pairing_pending: pending,
        }),
    }
}

async fn update_settings(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Json(body): Json<SettingsRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let agent = match body.agent_id.as_deref().or(body.assistant_id.as_deref()) {
        Some(name) => AgentId::from_alias(name).ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, format!("unknown agent: {name}"))
        })?,
        None => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "agentId or assistantId required",
            ));
        }
    };
    match state.registry.set_agent(&user_id, agent) {
        Ok(true) => Ok(StatusCode::OK),
        Ok(false) => Err(error_response(StatusCode::NOT_FOUND, "not paired")),
        Err(err) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )),
    }
}
