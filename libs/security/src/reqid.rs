use axum::{
    body::Body,
    http::{HeaderValue, Request, header::HeaderName},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Tags every request with a fresh id, exposed to handlers through request
/// extensions and echoed back on the response.
pub async fn with_request_id(mut req: Request<Body>, next: Next) -> Response {
    let rid = Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(rid.clone()));

    let mut res = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        res.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    res
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);
