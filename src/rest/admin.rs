//! `/api/admin/*`: slots, reservation review, users and announcements.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::{
    AnnouncementView, AppState, JsonBody, ListParams, Paginated, ReservationView, SlotView,
    UserView,
};
use crate::error::{ApiError, ApiResult};
use crate::middleware::CurrentSession;
use crate::models::ReservationStatus;
use crate::validation::{
    parse_id, validate_announcement, validate_capacity, validate_role, validate_slot,
};

#[derive(Deserialize)]
pub struct SlotBody {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub capacity: i64,
}

#[derive(Serialize)]
pub struct SlotResponse {
    pub message: &'static str,
    pub slot: SlotView,
}

pub async fn create_slot(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<SlotBody>,
) -> ApiResult<Json<SlotResponse>> {
    let capacity = validate_slot(&body.date, body.capacity)?;
    let slot = state.storage.insert_slot(body.date.trim().to_string(), capacity)?;
    tracing::info!(slot_id = slot.id, date = %slot.date, capacity, "slot created");

    Ok(Json(SlotResponse {
        message: "Slot created successfully",
        slot: slot.into(),
    }))
}

#[derive(Deserialize)]
pub struct CapacityBody {
    #[serde(default)]
    pub capacity: i64,
}

pub async fn update_slot(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
    JsonBody(body): JsonBody<CapacityBody>,
) -> ApiResult<Json<SlotResponse>> {
    let slot_id = parse_id(&raw_id, "slot_id")?;
    let capacity = validate_capacity(body.capacity)?;
    let slot = state.reservations.resize_slot(&state.storage, slot_id, capacity)?;
    Ok(Json(SlotResponse {
        message: "Slot updated successfully",
        slot: slot.into(),
    }))
}

#[derive(Serialize)]
pub struct SlotDeletedResponse {
    pub message: &'static str,
    pub slot_id: u64,
}

pub async fn delete_slot(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<SlotDeletedResponse>> {
    let slot_id = parse_id(&raw_id, "slot_id")?;
    state.reservations.delete_slot(&state.storage, slot_id)?;
    Ok(Json(SlotDeletedResponse {
        message: "Slot deleted successfully",
        slot_id,
    }))
}

#[derive(Serialize)]
pub struct ReviewResponse {
    pub message: &'static str,
    pub reservation: ReservationView,
}

fn review(
    state: &AppState,
    admin: &CurrentSession,
    raw_id: &str,
    next: ReservationStatus,
) -> ApiResult<ReservationView> {
    let reservation_id = parse_id(raw_id, "reservation_id")?;
    let reservation = state.reservations.transition(&state.storage, reservation_id, next)?;
    tracing::info!(reservation_id, admin_id = admin.user.id, status = %next, "reservation reviewed");
    Ok(reservation.into())
}

pub async fn approve_reservation(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<ReviewResponse>> {
    let reservation = review(&state, &current, &raw_id, ReservationStatus::Approved)?;
    Ok(Json(ReviewResponse {
        message: "Reservation approved successfully",
        reservation,
    }))
}

pub async fn reject_reservation(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<ReviewResponse>> {
    let reservation = review(&state, &current, &raw_id, ReservationStatus::Rejected)?;
    Ok(Json(ReviewResponse {
        message: "Reservation rejected successfully",
        reservation,
    }))
}

/// All reservations, optionally filtered by `status` and `slot_id`.
pub async fn list_reservations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Paginated<ReservationView>>> {
    let pagination = params.pagination()?;
    let status = params.status()?;
    let slot_id = match params.slot_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(parse_id(raw, "slot_id")?),
    };

    let reservations = state
        .storage
        .list_reservations()?
        .into_iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .filter(|r| slot_id.map_or(true, |id| r.slot_id == id))
        .map(ReservationView::from)
        .collect();
    Ok(Json(Paginated::new(reservations, pagination)))
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Paginated<UserView>>> {
    let pagination = params.pagination()?;
    let users = state
        .storage
        .list_users()?
        .iter()
        .map(UserView::from)
        .collect();
    Ok(Json(Paginated::new(users, pagination)))
}

#[derive(Serialize)]
pub struct UserDeletedResponse {
    pub message: &'static str,
    pub user_id: u64,
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<UserDeletedResponse>> {
    let user_id = parse_id(&raw_id, "user_id")?;
    if user_id == current.user.id {
        return Err(ApiError::invalid_input("Cannot delete your own account")
            .with_details(json!({ "user_id": user_id })));
    }
    if !state.storage.soft_delete_user(user_id)? {
        return Err(
            ApiError::not_found("User not found").with_details(json!({ "user_id": user_id }))
        );
    }
    tracing::info!(user_id, admin_id = current.user.id, "user deleted");
    Ok(Json(UserDeletedResponse {
        message: "User deleted successfully",
        user_id,
    }))
}

#[derive(Deserialize)]
pub struct RoleBody {
    #[serde(default)]
    pub role: String,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub message: &'static str,
    pub user: UserView,
}

pub async fn update_user_role(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(raw_id): Path<String>,
    JsonBody(body): JsonBody<RoleBody>,
) -> ApiResult<Json<UserResponse>> {
    let user_id = parse_id(&raw_id, "user_id")?;
    let role = validate_role(&body.role)?;
    let mut previous = role;
    let user = state
        .storage
        .modify_user(user_id, |user| {
            previous = user.role;
            user.role = role;
        })?
        .ok_or_else(|| {
            ApiError::not_found("User not found").with_details(json!({ "user_id": user_id }))
        })?;
    tracing::info!(user_id, admin_id = current.user.id, from = %previous, to = %role, "user role changed");

    Ok(Json(UserResponse {
        message: "User role updated successfully",
        user: UserView::from(&user),
    }))
}

#[derive(Deserialize)]
pub struct AnnouncementBody {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Serialize)]
pub struct AnnouncementResponse {
    pub message: &'static str,
    pub announcement: AnnouncementView,
}

fn announcement_not_found(announcement_id: u64) -> ApiError {
    ApiError::not_found("Announcement not found")
        .with_details(json!({ "announcement_id": announcement_id }))
}

pub async fn create_announcement(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    JsonBody(body): JsonBody<AnnouncementBody>,
) -> ApiResult<Json<AnnouncementResponse>> {
    validate_announcement(&body.title, &body.content)?;
    let announcement = state.storage.insert_announcement(
        body.title.trim().to_string(),
        body.content,
        Some(current.user.id),
    )?;
    tracing::info!(announcement_id = announcement.id, author_id = current.user.id, "announcement created");

    Ok(Json(AnnouncementResponse {
        message: "Announcement created successfully",
        announcement: AnnouncementView::load(&state.storage, announcement)?,
    }))
}

pub async fn update_announcement(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
    JsonBody(body): JsonBody<AnnouncementBody>,
) -> ApiResult<Json<AnnouncementResponse>> {
    let announcement_id = parse_id(&raw_id, "announcement_id")?;
    validate_announcement(&body.title, &body.content)?;
    let mut announcement = state
        .storage
        .get_announcement(announcement_id)?
        .ok_or_else(|| announcement_not_found(announcement_id))?;

    announcement.title = body.title.trim().to_string();
    announcement.content = body.content;
    announcement.updated_at = chrono::Utc::now();
    state.storage.update_announcement(&announcement)?;
    tracing::info!(announcement_id, "announcement updated");

    Ok(Json(AnnouncementResponse {
        message: "Announcement updated successfully",
        announcement: AnnouncementView::load(&state.storage, announcement)?,
    }))
}

#[derive(Serialize)]
pub struct AnnouncementDeletedResponse {
    pub message: &'static str,
    pub announcement_id: u64,
}

pub async fn delete_announcement(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<AnnouncementDeletedResponse>> {
    let announcement_id = parse_id(&raw_id, "announcement_id")?;
    if !state.storage.delete_announcement(announcement_id)? {
        return Err(announcement_not_found(announcement_id));
    }
    tracing::info!(announcement_id, "announcement deleted");
    Ok(Json(AnnouncementDeletedResponse {
        message: "Announcement deleted successfully",
        announcement_id,
    }))
}
