//! `/api/user/*` and the dashboard: the caller's own account.

use axum::{
    extract::State,
    http::{header, HeaderMap},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use super::{hash_password, AppState, JsonBody, MessageResponse, UserView};
use crate::business::BusinessRules;
use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::middleware::CurrentSession;
use crate::session::{header_value, CSRF_HEADER};
use crate::storage::StorageError;
use crate::validation::{validate_email, validate_password};

#[derive(Serialize)]
pub struct ProfileResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    pub user: UserView,
}

pub async fn get_profile(Extension(current): Extension<CurrentSession>) -> Json<ProfileResponse> {
    Json(ProfileResponse {
        message: None,
        user: UserView::from(&current.user),
    })
}

/// Empty strings mean "leave unchanged", as do absent fields.
#[derive(Deserialize)]
pub struct UpdateProfileBody {
    pub email: Option<String>,
    pub password: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

fn provided(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    JsonBody(body): JsonBody<UpdateProfileBody>,
) -> ApiResult<(HeaderMap, Json<ProfileResponse>)> {
    let email = provided(body.email);
    if let Some(email) = &email {
        validate_email(email)?;
    }
    let new_password = provided(body.password);
    if let Some(password) = &new_password {
        validate_password(password)?;
    }
    // hash before touching the record; the write below re-reads it
    let password_hash = match new_password {
        Some(password) => Some(hash_password(&state, password).await?),
        None => None,
    };
    let first_name = body.first_name.map(|v| v.trim().to_string());
    let last_name = body.last_name.map(|v| v.trim().to_string());
    let phone = body.phone.map(|v| v.trim().to_string());

    let user = state
        .storage
        .modify_user(current.user.id, |user| {
            if let Some(email) = &email {
                user.email = email.clone();
            }
            if let Some(first_name) = &first_name {
                user.first_name = first_name.clone();
            }
            if let Some(last_name) = &last_name {
                user.last_name = last_name.clone();
            }
            if let Some(phone) = &phone {
                user.phone = phone.clone();
            }
            if let Some(hash) = &password_hash {
                user.password_hash = hash.clone();
                user.session_version += 1;
            }
        })
        .map_err(|e| match e {
            StorageError::DuplicateEmail(email) => {
                ApiError::new(ErrorCode::DuplicateEmail, "Email already in use")
                    .with_details(json!({ "email": email }))
            }
            other => other.into(),
        })?
        .ok_or_else(|| ApiError::unauthorized("Session expired, please log in again"))?;

    // a password change logs out every other session and re-issues this one
    let mut headers = HeaderMap::new();
    if password_hash.is_some() {
        state.storage.delete_sessions_for_user(user.id)?;
        let issued = state.sessions.start(&state.storage, &user)?;
        headers = issued.headers()?;
        tracing::info!(user_id = user.id, "password changed, other sessions revoked");
    }
    tracing::info!(user_id = user.id, "profile updated");

    Ok((
        headers,
        Json(ProfileResponse {
            message: Some("Profile updated successfully"),
            user: UserView::from(&user),
        }),
    ))
}

#[derive(Serialize)]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
}

/// Rotate the CSRF token on demand.
pub async fn csrf_token(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
) -> ApiResult<(HeaderMap, Json<CsrfTokenResponse>)> {
    let mut record = current.record;
    state.sessions.rotate_csrf(&state.storage, &mut record)?;

    let mut headers = HeaderMap::new();
    headers.insert(CSRF_HEADER, header_value(&record.csrf_token)?);
    Ok((
        headers,
        Json(CsrfTokenResponse {
            csrf_token: record.csrf_token,
        }),
    ))
}

/// Bump the session version: every session of this user, this one
/// included, stops working.
pub async fn logout_all(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
) -> ApiResult<(HeaderMap, Json<MessageResponse>)> {
    let user_id = current.user.id;
    state.storage.bump_session_version(user_id)?;
    let dropped = state.storage.delete_sessions_for_user(user_id)?;
    tracing::info!(user_id, sessions_dropped = dropped, "logged out everywhere");

    let mut headers = HeaderMap::new();
    headers.insert(header::SET_COOKIE, header_value(&state.sessions.clear_cookie())?);
    Ok((
        headers,
        Json(MessageResponse {
            message: "Logged out from all sessions",
        }),
    ))
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct DashboardResponse {
    pub total_children: usize,
    pub total_reservations: usize,
    pub open_slots: usize,
}

/// Admins see system-wide totals, parents their own. `open_slots` is
/// global either way.
pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
) -> ApiResult<Json<DashboardResponse>> {
    let storage = &state.storage;
    let (total_children, total_reservations) = if current.user.is_admin() {
        (storage.list_children()?.len(), storage.list_reservations()?.len())
    } else {
        let own: HashSet<u64> = storage
            .list_children_for_parent(current.user.id)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let reservations = storage
            .list_reservations()?
            .into_iter()
            .filter(|r| own.contains(&r.child_id))
            .count();
        (own.len(), reservations)
    };

    let booked = BusinessRules::new(storage).booked_counts()?;
    let open_slots = storage
        .list_slots()?
        .iter()
        .filter(|s| booked.get(&s.id).copied().unwrap_or(0) < s.capacity)
        .count();

    Ok(Json(DashboardResponse {
        total_children,
        total_reservations,
        open_slots,
    }))
}
