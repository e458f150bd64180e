//! Bearer-JWT authentication middleware for the control-plane routers.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::warn;

use crate::jwt::JwtVerifier;

/// Authenticated user id extracted from the bearer token, injected into
/// request extensions for handlers to consume.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub String);

/// Shared verifier handle installed on the router via `Extension`.
pub type SharedVerifier = Arc<JwtVerifier>;

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({ "error": message })),
    )
        .into_response()
}

fn bearer_token(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Verifies `Authorization: Bearer <JWT>` and injects [`AuthedUser`].
///
/// CORS preflights pass through untouched; the token is the real
/// authorization on every other method.
pub async fn require_bearer(mut req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    let Some(verifier) = req.extensions().get::<SharedVerifier>().cloned() else {
        warn!("bearer middleware mounted without a verifier extension");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let Some(token) = bearer_token(&req) else {
        return unauthorized("missing bearer token");
    };

    match verifier.verify_subject(token) {
        Ok(user_id) => {
            req.extensions_mut().insert(AuthedUser(user_id));
            next.run(req).await
        }
        Err(err) => {
            warn!(error = %err, "bearer token rejected");
            unauthorized("invalid or expired token")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::GatewayClaims;
    use axum::{Extension, Router, middleware, routing::get};
    use time::Duration;
    use tower::ServiceExt;

    async fn whoami(Extension(user): Extension<AuthedUser>) -> String {
        user.0
    }

    fn app(verifier: Arc<JwtVerifier>) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn(require_bearer))
            .layer(Extension(verifier))
    }

    fn request(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/whoami");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn valid_token_reaches_handler() {
        let verifier = Arc::new(JwtVerifier::new("secret").unwrap());
        let token = verifier
            .sign(&GatewayClaims::for_user("u7", Duration::minutes(5)))
            .unwrap();
        let res = app(verifier).oneshot(request(Some(&token))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = http_body_util::BodyExt::collect(res.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&body[..], b"u7");
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let verifier = Arc::new(JwtVerifier::new("secret").unwrap());
        let res = app(verifier).oneshot(request(None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_token_is_401() {
        let verifier = Arc::new(JwtVerifier::new("secret").unwrap());
        let res = app(verifier)
            .oneshot(request(Some("not-a-jwt")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn preflight_bypasses_auth() {
        let verifier = Arc::new(JwtVerifier::new("secret").unwrap());
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/whoami")
            .body(Body::empty())
            .unwrap();
        let res = app(verifier).oneshot(req).await.unwrap();
        // The route itself answers; what matters is that auth didn't 401 it.
        assert_ne!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
