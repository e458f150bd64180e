//! Control-plane REST API: login, QR retrieval, session lifecycle.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use qrcode::QrCode;
use serde::Serialize;
use tbg_core::GatewayError;
use tbg_security::{AuthedUser, SharedVerifier, require_bearer, with_request_id};
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::session::{SessionHandle, SessionManager};

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<SessionManager>,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatus {
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_number: Option<String>,
    qr_available: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    session_id: String,
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_number: Option<String>,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_connected: Option<String>,
    needs_repair: bool,
}

fn summarize(handle: &SessionHandle) -> SessionSummary {
    let meta = handle.meta.lock().unwrap();
    let fmt = time::format_description::well_known::Rfc3339;
    SessionSummary {
        session_id: meta.record.session_id.clone(),
        connected: meta.connected,
        phone_number: meta.record.phone_number.clone(),
        created_at: meta
            .record
            .created_at
            .format(&fmt)
            .unwrap_or_default(),
        last_connected: meta
            .record
            .last_connected
            .and_then(|t| t.format(&fmt).ok()),
        needs_repair: meta.needs_repair,
    }
}

pub fn build_router(state: ApiState, verifier: SharedVerifier) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/login/{session_id}/qr", get(login_qr))
        .route("/login/{session_id}/status", get(login_status))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}", axum::routing::delete(delete_session))
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

async fn login(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    headers: HeaderMap,
) -> Response {
    // The session keeps the caller's bearer token for agent calls.
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let Some(token) = token else {
        return error_response(StatusCode::UNAUTHORIZED, "missing bearer token");
    };

    match state.manager.create_session(&user_id, token).await {
        Ok(handle) => Json(LoginResponse {
            session_id: handle.session_id.clone(),
        })
        .into_response(),
        Err(GatewayError::SessionLimit(max)) => error_response(
            StatusCode::CONFLICT,
            format!("maximum concurrent sessions reached ({max})"),
        ),
        Err(err) => {
            error!(user_id = %user_id, error = %err, "login failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "session creation failed")
        }
    }
}

async fn login_qr(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path(session_id): Path<String>,
) -> Response {
    let Some(handle) = state.manager.get_owned(&user_id, &session_id) else {
        return error_response(StatusCode::NOT_FOUND, "session not found");
    };

    let (connected, qr) = {
        let meta = handle.meta.lock().unwrap();
        (meta.connected, meta.current_qr.clone())
    };
    if connected {
        return (StatusCode::OK, "already connected").into_response();
    }
    let Some(qr) = qr else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "qr not ready");
    };

    match render_qr_png(&qr) {
        Ok(png) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/png")],
            png,
        )
            .into_response(),
        Err(err) => {
            error!(session_id = %session_id, error = %err, "qr render failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "qr render failed")
        }
    }
}

async fn login_status(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path(session_id): Path<String>,
) -> Response {
    let Some(handle) = state.manager.get_owned(&user_id, &session_id) else {
        return error_response(StatusCode::NOT_FOUND, "session not found");
    };
    let meta = handle.meta.lock().unwrap();
    Json(SessionStatus {
        connected: meta.connected,
        phone_number: meta.record.phone_number.clone(),
        qr_available: meta.current_qr.is_some(),
    })
    .into_response()
}

async fn list_sessions(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
) -> Json<Vec<SessionSummary>> {
    Json(
        state
            .manager
            .sessions_for_user(&user_id)
            .iter()
            .map(|handle| summarize(handle))
            .collect(),
    )
}

async fn delete_session(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path(session_id): Path<String>,
) -> Response {
    match state.manager.destroy_session(&user_id, &session_id).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "session not found"),
        Err(err) => {
            error!(session_id = %session_id, error = %err, "session destroy failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "session destroy failed")
        }
    }
}

/// Renders the bridge's QR payload as a PNG: 8x module scale with a
/// 4-module quiet zone.
fn render_qr_png(payload: &str) -> anyhow::Result<Vec<u8>> {
    const SCALE: usize = 8;
    const QUIET: usize = 4;

    let code = QrCode::new(payload.as_bytes())?;
    let width = code.width();
    let colors = code.to_colors();
    let size = ((width + QUIET * 2) * SCALE) as u32;
    let mut img = image::GrayImage::from_pixel(size, size, image::Luma([255u8]));

    for y in 0..width {
        for x in 0..width {
            if colors[y * width + x] == qrcode::Color::Dark {
                for dy in 0..SCALE {
                    for dx in 0..SCALE {
                        img.put_pixel(
                            ((x + QUIET) * SCALE + dx) as u32,
                            ((y + QUIET) * SCALE + dy) as u32,
                            image::Luma([0u8]),
                        );
                    }
                }
            }
        }
    }

    let mut buf = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::Path as FsPath;
    use tbg_backend::{BackendApi, Dispatcher, RefreshedToken};
    use tbg_core::AgentId;
    use tbg_security::{GatewayClaims, JwtVerifier, TokenCipher};
    use tbg_session::WhatsAppSessionStore;
    use time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::transport::{SocketHandle, WhatsAppTransport};

    struct NeverTransport;

    #[async_trait]
    impl WhatsAppTransport for NeverTransport {
        async fn connect(&self, _session_id: &str, _dir: &FsPath) -> Result<SocketHandle> {
            Err(anyhow!("not used in tests"))
        }
    }

    struct NoRuntime;

    #[async_trait]
    impl tbg_backend::AgentRuntime for NoRuntime {
        async fn generate(
            &self,
            _agent: AgentId,
            _messages: &[tbg_backend::AgentMessage],
            _context: &tbg_core::RequestContext,
        ) -> Result<tbg_backend::AgentReply> {
            Err(anyhow!("unused"))
        }
    }

    struct NoBackend;

    #[async_trait]
    impl BackendApi for NoBackend {
        async fn refresh_whatsapp_token(&self, _s: &str) -> Result<RefreshedToken> {
            Err(anyhow!("unused"))
        }
        async fn refresh_telegram_token(&self, _u: &str) -> Result<RefreshedToken> {
            Err(anyhow!("unused"))
        }
        async fn list_projects(&self, _t: &str) -> Result<Vec<tbg_backend::Project>> {
            Ok(Vec::new())
        }
        async fn morning_briefing(&self, _t: &str) -> Result<tbg_backend::MorningBriefing> {
            Ok(Default::default())
        }
        async fn list_goals(&self, _t: &str) -> Result<Vec<tbg_backend::Goal>> {
            Ok(Vec::new())
        }
        async fn active_sprint(&self, _t: &str) -> Result<Option<tbg_backend::Sprint>> {
            Ok(None)
        }
        async fn sprint_risks(&self, _t: &str, _s: &str) -> Result<Vec<tbg_backend::RiskSignal>> {
            Ok(Vec::new())
        }
    }

    fn fixture(dir: &FsPath, max_sessions: usize) -> (Router, Arc<SessionManager>, String) {
        let store = WhatsAppSessionStore::new(dir, TokenCipher::new("secret")).unwrap();
        let (_tx, rx) = watch::channel(false);
        let manager = SessionManager::new(
            store,
            Arc::new(NeverTransport),
            Dispatcher::new(Arc::new(NoRuntime)),
            Arc::new(NoBackend),
            max_sessions,
            false,
            rx,
        );
        let verifier = Arc::new(JwtVerifier::new("jwt-secret").unwrap());
        let token = verifier
            .sign(&GatewayClaims::for_user("u1", Duration::minutes(5)))
            .unwrap();
        let router = build_router(
            ApiState {
                manager: Arc::clone(&manager),
            },
            verifier,
        );
        (router, manager, token)
    }

    fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(res: Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn login_is_idempotent_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let (router, manager, token) = fixture(dir.path(), 10);

        let first = body_json(
            router
                .clone()
                .oneshot(authed("POST", "/login", &token))
                .await
                .unwrap(),
        )
        .await;
        let second = body_json(
            router
                .oneshot(authed("POST", "/login", &token))
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(first["sessionId"], second["sessionId"]);
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn login_hits_the_session_cap_with_409() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _manager, _token) = fixture(dir.path(), 1);
        let verifier = JwtVerifier::new("jwt-secret").unwrap();

        let token_a = verifier
            .sign(&GatewayClaims::for_user("ua", Duration::minutes(5)))
            .unwrap();
        let token_b = verifier
            .sign(&GatewayClaims::for_user("ub", Duration::minutes(5)))
            .unwrap();

        let res = router
            .clone()
            .oneshot(authed("POST", "/login", &token_a))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = router
            .oneshot(authed("POST", "/login", &token_b))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn qr_is_503_until_available_then_png() {
        let dir = tempfile::tempdir().unwrap();
        let (router, manager, token) = fixture(dir.path(), 10);
        let login = body_json(
            router
                .clone()
                .oneshot(authed("POST", "/login", &token))
                .await
                .unwrap(),
        )
        .await;
        let session_id = login["sessionId"].as_str().unwrap().to_string();

        let res = router
            .clone()
            .oneshot(authed("GET", &format!("/login/{session_id}/qr"), &token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        manager
            .get_owned("u1", &session_id)
            .unwrap()
            .meta
            .lock()
            .unwrap()
            .current_qr = Some("2@test-qr-payload".into());

        let res = router
            .oneshot(authed("GET", &format!("/login/{session_id}/qr"), &token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[tokio::test]
    async fn foreign_sessions_look_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _manager, token) = fixture(dir.path(), 10);
        let verifier = JwtVerifier::new("jwt-secret").unwrap();
        let other = verifier
            .sign(&GatewayClaims::for_user("intruder", Duration::minutes(5)))
            .unwrap();

        let login = body_json(
            router
                .clone()
                .oneshot(authed("POST", "/login", &token))
                .await
                .unwrap(),
        )
        .await;
        let session_id = login["sessionId"].as_str().unwrap();

        let res = router
            .clone()
            .oneshot(authed(
                "GET",
                &format!("/login/{session_id}/status"),
                &other,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = router
            .oneshot(authed("DELETE", &format!("/sessions/{session_id}"), &other))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_twice_is_404_the_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _manager, token) = fixture(dir.path(), 10);
        let login = body_json(
            router
                .clone()
                .oneshot(authed("POST", "/login", &token))
                .await
                .unwrap(),
        )
        .await;
        let session_id = login["sessionId"].as_str().unwrap().to_string();

        let res = router
            .clone()
            .oneshot(authed("DELETE", &format!("/sessions/{session_id}"), &token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = router
            .oneshot(authed("DELETE", &format!("/sessions/{session_id}"), &token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sessions_lists_only_the_callers() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _manager, token) = fixture(dir.path(), 10);
        router
            .clone()
            .oneshot(authed("POST", "/login", &token))
            .await
            .unwrap();

        let res = router
            .oneshot(authed("GET", "/sessions", &token))
            .await
            .unwrap();
        let json = body_json(res).await;
        let list = json.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["connected"], false);
        assert_eq!(list[0]["needsRepair"], false);
    }

    #[test]
    fn qr_png_has_reasonable_dimensions() {
        let png = render_qr_png("2@abcdefg").unwrap();
        let img = image::load_from_memory(&png).unwrap();
        assert!(img.width() >= 200);
        assert_eq!(img.width(), img.height());
    }
}
