//! `/api/auth/*`: account creation, login/logout and password reset.

use axum::{
    extract::State,
    http::{header, HeaderMap},
    Extension, Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::{hash_password, verify_password, AppState, JsonBody, MessageResponse, UserView};
use crate::auth::random_token;
use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::middleware::CurrentSession;
use crate::models::{PasswordResetToken, Role};
use crate::session::header_value;
use crate::storage::NewUser;
use crate::validation::{validate_email, validate_password};

pub const RESET_TOKEN_TTL_MINUTES: i64 = 30;

#[derive(Deserialize)]
pub struct CredentialsBody {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub message: &'static str,
    pub user: UserView,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<CredentialsBody>,
) -> ApiResult<(HeaderMap, Json<AuthResponse>)> {
    validate_email(&body.email)?;
    validate_password(&body.password)?;

    let password_hash = hash_password(&state, body.password).await?;
    let user = state.storage.create_user(NewUser {
        email: body.email,
        password_hash,
        role: Role::Parent,
    })?;
    let issued = state.sessions.start(&state.storage, &user)?;
    tracing::info!(user_id = user.id, "user registered");

    Ok((
        issued.headers()?,
        Json(AuthResponse {
            message: "User registered successfully",
            user: UserView::from(&user),
        }),
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<CredentialsBody>,
) -> ApiResult<(HeaderMap, Json<AuthResponse>)> {
    validate_email(&body.email)?;
    validate_password(&body.password)?;

    if let Some(retry_after) = state.login_attempts.check(&body.email) {
        return Err(ApiError::new(
            ErrorCode::RateLimitExceeded,
            "Too many failed login attempts. Please try again in 5 minutes.",
        )
        .with_details(json!({ "retry_after": retry_after })));
    }

    let invalid = || ApiError::unauthorized("Invalid credentials");
    let Some(user) = state.storage.find_user_by_email(&body.email)? else {
        state.login_attempts.record_failure(&body.email);
        tracing::info!(email = %body.email, "login for unknown email");
        return Err(invalid());
    };
    if !verify_password(body.password, user.password_hash.clone()).await? {
        state.login_attempts.record_failure(&body.email);
        tracing::info!(user_id = user.id, "login with wrong password");
        return Err(invalid());
    }
    state.login_attempts.reset(&body.email);

    // never carry a pre-login session over
    if let Some(previous) = state.sessions.load(&state.storage, &headers)? {
        state.sessions.destroy(&state.storage, &previous.id)?;
    }
    let issued = state.sessions.start(&state.storage, &user)?;
    tracing::info!(user_id = user.id, "user logged in");

    Ok((
        issued.headers()?,
        Json(AuthResponse {
            message: "Logged in successfully",
            user: UserView::from(&user),
        }),
    ))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
) -> ApiResult<(HeaderMap, Json<MessageResponse>)> {
    state.sessions.destroy(&state.storage, &current.record.id)?;
    tracing::info!(user_id = current.user.id, "user logged out");

    let mut headers = HeaderMap::new();
    headers.insert(header::SET_COOKIE, header_value(&state.sessions.clear_cookie())?);
    Ok((
        headers,
        Json(MessageResponse {
            message: "Logged out successfully",
        }),
    ))
}

#[derive(Deserialize)]
pub struct RequestResetBody {
    #[serde(default)]
    pub email: String,
}

#[derive(Serialize)]
pub struct RequestResetResponse {
    pub message: &'static str,
    pub email: String,
}

pub async fn request_reset(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<RequestResetBody>,
) -> ApiResult<Json<RequestResetResponse>> {
    validate_email(&body.email)?;
    let user = state.storage.find_user_by_email(&body.email)?.ok_or_else(|| {
        ApiError::not_found("User not found").with_details(json!({ "email": body.email }))
    })?;

    let now = Utc::now();
    let purged = state.storage.purge_expired_reset_tokens(now)?;
    if purged > 0 {
        tracing::debug!(purged, "expired reset tokens removed");
    }
    let token = PasswordResetToken {
        token: random_token(),
        user_id: user.id,
        expires_at: now + Duration::minutes(RESET_TOKEN_TTL_MINUTES),
    };
    state.storage.put_reset_token(&token)?;

    let link = format!("{}/reset-password?token={}", state.config.app_base_url, token.token);
    if let Err(e) = state.mailer.send_password_reset(&user.email, &link).await {
        // delivery problems must not reveal anything to the caller
        tracing::error!(user_id = user.id, error = %e, "password reset mail not delivered");
    }
    tracing::info!(user_id = user.id, "password reset requested");

    Ok(Json(RequestResetResponse {
        message: "Password reset email sent",
        email: body.email,
    }))
}

#[derive(Deserialize)]
pub struct ResetPasswordBody {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub password: String,
}

/// Consume a reset token. Every session of the account dies with the old
/// password.
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<ResetPasswordBody>,
) -> ApiResult<(HeaderMap, Json<MessageResponse>)> {
    validate_password(&body.password)?;

    let invalid_token = || ApiError::new(ErrorCode::InvalidToken, "Invalid or expired token");
    let token = state
        .storage
        .take_reset_token(&body.token)?
        .filter(|t| !t.is_expired(Utc::now()))
        .ok_or_else(invalid_token)?;

    let password_hash = hash_password(&state, body.password).await?;
    let user = state
        .storage
        .modify_user(token.user_id, |user| {
            user.password_hash = password_hash.clone();
            user.session_version += 1;
        })?
        .ok_or_else(|| {
            ApiError::not_found("User not found").with_details(json!({ "user_id": token.user_id }))
        })?;
    let dropped = state.storage.delete_sessions_for_user(user.id)?;
    state.login_attempts.reset(&user.email);
    tracing::info!(user_id = user.id, sessions_dropped = dropped, "password reset completed");

    let mut headers = HeaderMap::new();
    headers.insert(header::SET_COOKIE, header_value(&state.sessions.clear_cookie())?);
    Ok((
        headers,
        Json(MessageResponse {
            message: "Password reset successful",
        }),
    ))
}
