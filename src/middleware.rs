//! Request guards and response decoration.
//!
//! Protected routes stack, outermost first: session auth, admin gate (admin
//! routes only), CSRF. The per-IP throttle wraps the whole router.
//! The session layer puts a [`CurrentSession`] into the request extensions
//! for everything behind it.

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::auth::tokens_match;
use crate::error::{ApiError, ErrorCode};
use crate::models::{SessionRecord, User};
use crate::rest::AppState;
use crate::session::{header_value, CSRF_HEADER};

/// Authenticated caller, as resolved by the session layer.
#[derive(Debug, Clone)]
pub struct CurrentSession {
    pub record: SessionRecord,
    pub user: User,
}

const FORM_BODY_LIMIT: usize = 64 * 1024;

/// Resolve the caller's session. `Ok(None)` means no usable session; `Err`
/// carries a ready 401 for a session invalidated by a version bump.
fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<CurrentSession>, Response> {
    let storage = &state.storage;
    let mut record = match state.sessions.load(storage, headers) {
        Ok(Some(record)) => record,
        Ok(None) => return Ok(None),
        Err(e) => return Err(e.into_response()),
    };

    let user = match storage.get_user(record.user_id) {
        Ok(user) => user,
        Err(e) => return Err(ApiError::from(e).into_response()),
    };
    let user = match user {
        Some(user) if user.session_version == record.session_version => user,
        other => {
            tracing::info!(
                user_id = record.user_id,
                session_version = record.session_version,
                current_version = other.map(|u| u.session_version),
                "stale session rejected"
            );
            if let Err(e) = state.sessions.destroy(storage, &record.id) {
                return Err(e.into_response());
            }
            let mut response =
                ApiError::unauthorized("Session expired, please log in again").into_response();
            if let Ok(clear) = HeaderValue::from_str(&state.sessions.clear_cookie()) {
                response.headers_mut().insert(header::SET_COOKIE, clear);
            }
            return Err(response);
        }
    };

    if let Err(e) = state.sessions.ensure_csrf(storage, &mut record) {
        return Err(e.into_response());
    }
    Ok(Some(CurrentSession { record, user }))
}

async fn run_authenticated(current: CurrentSession, mut req: Request, next: Next) -> Response {
    let csrf = current.record.csrf_token.clone();
    req.extensions_mut().insert(current);
    let mut response = next.run(req).await;
    // handlers that rotate the token set the header themselves
    if !response.headers().contains_key(&CSRF_HEADER) {
        if let Ok(value) = header_value(&csrf) {
            response.headers_mut().insert(CSRF_HEADER, value);
        }
    }
    response
}

/// Require a live session; anonymous callers get 401.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    match authenticate(&state, req.headers()) {
        Ok(Some(current)) => run_authenticated(current, req, next).await,
        Ok(None) => ApiError::unauthorized("Not logged in").into_response(),
        Err(response) => response,
    }
}

/// Session check for the admin surface. Anonymous callers get the same 404
/// as an unknown route, so the admin paths stay hidden.
pub async fn require_admin_session(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    match authenticate(&state, req.headers()) {
        Ok(Some(current)) => run_authenticated(current, req, next).await,
        Ok(None) => ApiError::not_found("Resource not found").into_response(),
        Err(response) => response,
    }
}

#[derive(Deserialize)]
struct CsrfForm {
    csrf_token: Option<String>,
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// State-changing requests must echo the session's CSRF token, in the
/// `X-CSRF-Token` header or a `csrf_token` form field.
pub async fn csrf_guard(
    Extension(current): Extension<CurrentSession>,
    req: Request,
    next: Next,
) -> Response {
    if !matches!(*req.method(), Method::POST | Method::PUT | Method::DELETE) {
        return next.run(req).await;
    }

    let header_token = req
        .headers()
        .get(&CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from);

    let (supplied, req) = match header_token {
        Some(token) => (Some(token), req),
        None if is_form(req.headers()) => {
            let (parts, body) = req.into_parts();
            let bytes = match to_bytes(body, FORM_BODY_LIMIT).await {
                Ok(bytes) => bytes,
                Err(_) => return ApiError::invalid_input("Request body too large").into_response(),
            };
            let token = serde_urlencoded::from_bytes::<CsrfForm>(&bytes)
                .ok()
                .and_then(|form| form.csrf_token);
            (token, Request::from_parts(parts, Body::from(bytes)))
        }
        None => (None, req),
    };

    match supplied {
        Some(token) if tokens_match(&current.record.csrf_token, &token) => next.run(req).await,
        _ => {
            tracing::warn!(
                user_id = current.user.id,
                method = %req.method(),
                path = %req.uri().path(),
                "invalid CSRF token"
            );
            ApiError::new(ErrorCode::CsrfInvalid, "Invalid CSRF token").into_response()
        }
    }
}

/// Client address for throttling: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the peer address, then loopback.
pub fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> IpAddr {
    let forwarded: Option<IpAddr> = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
    };
    forwarded
        .or_else(real)
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip()))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Per-IP request budget. Off in test mode.
pub async fn throttle_requests(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.config.test_mode {
        return next.run(req).await;
    }
    let ip = client_ip(req.headers(), req.extensions().get::<ConnectInfo<SocketAddr>>());
    match state.request_limiter.check(ip) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            tracing::warn!(%ip, path = %req.uri().path(), "request rate limit exceeded");
            ApiError::new(
                ErrorCode::RateLimitExceeded,
                "Rate limit exceeded. Please try again later.",
            )
            .with_details(json!({ "retry_after": retry_after }))
            .into_response()
        }
    }
}

/// Admins only. Runs after the session layer, before CSRF.
pub async fn admin_gate(
    Extension(current): Extension<CurrentSession>,
    req: Request,
    next: Next,
) -> Response {
    if !current.user.is_admin() {
        tracing::warn!(user_id = current.user.id, role = %current.user.role, "admin route forbidden");
        return ApiError::forbidden().into_response();
    }
    next.run(req).await
}

/// Hardening headers on every response.
pub async fn security_headers(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=(), payment=()"),
    );
    if let Ok(csp) = HeaderValue::from_str(&state.config.csp) {
        headers.insert(header::CONTENT_SECURITY_POLICY, csp);
    }
    if state.config.enable_hsts {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
        );
    }
    response
}
