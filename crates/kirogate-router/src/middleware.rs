use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use kirogate_common::ErrorResponse;
use kirogate_core::AppContext;

#[derive(Clone)]
pub struct RequestId(pub String);

/// Honor a client-provided `X-Request-ID`, else mint one; echo it back and
/// stash it for handlers and accounting.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let rid = request_id_from_headers(req.headers());
    req.extensions_mut().insert(RequestId(rid.clone()));
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert("X-Request-ID", value);
    }
    resp
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4()))
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("Authorization").and_then(|v| v.to_str().ok()) {
        let trimmed = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn requires_auth(path: &str) -> bool {
    if path == "/health" {
        return false;
    }
    if path.starts_with("/api/") {
        return true;
    }
    // /v1/... or /{group}/v1/...
    let mut parts = path.trim_start_matches('/').split('/');
    match (parts.next(), parts.next()) {
        (Some("v1"), _) => true,
        (_, Some("v1")) => true,
        _ => false,
    }
}

/// API-key validation plus group scoping for `/{group}/v1/...` routes.
pub async fn api_key_auth(
    State(ctx): State<Arc<AppContext>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if !requires_auth(&path) {
        return next.run(req).await;
    }

    let Some(key) = extract_api_key(req.headers()) else {
        return unauthorized("missing API key");
    };
    if ctx.api_keys.get(&key).await.is_none() {
        return unauthorized("invalid API key");
    }

    // Group scoping: the first path segment of /{group}/v1/... must be in
    // the key's whitelist (empty whitelist = all groups).
    let mut parts = path.trim_start_matches('/').split('/');
    if let (Some(head), Some("v1")) = (parts.next(), parts.next()) {
        if head != "v1" && head != "api" && head != "static" {
            if !ctx.api_keys.has_group_permission(&key, head).await {
                return (
                    StatusCode::FORBIDDEN,
                    Json(ErrorResponse::from_status(403, "group not allowed for this API key")),
                )
                    .into_response();
            }
        }
    }

    next.run(req).await
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::from_status(401, message)),
    )
        .into_response()
}

/// Global token-bucket limiter. Only POSTs on the completion surface are
/// gated; reads and the admin surface pass through.
pub async fn rate_limit(
    State(ctx): State<Arc<AppContext>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    let gated = req.method() == Method::POST
        && !path.starts_with("/api/")
        && requires_auth(path)
        && path != "/health";
    if gated {
        if let Err(delay) = ctx.limiter.check() {
            let retry_after = delay.as_secs() + 1;
            let mut resp = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorResponse::from_status(429, "rate limit exceeded")),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                resp.headers_mut().insert("Retry-After", value);
            }
            return resp;
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_scope_covers_v1_and_group_v1() {
        assert!(requires_auth("/v1/messages"));
        assert!(requires_auth("/pro/v1/messages"));
        assert!(requires_auth("/api/tokens"));
        assert!(!requires_auth("/health"));
        assert!(!requires_auth("/"));
    }

    #[test]
    fn api_key_extraction_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer sk-abc"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-other"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-abc"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-xyz"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-xyz"));

        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }
}
