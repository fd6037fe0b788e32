//! `/api/parent/*`: a parent's children and reservations. Every lookup is
//! scoped to the caller; someone else's records read as missing.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use super::{AppState, ChildView, JsonBody, ListParams, Paginated, ReservationView};
use crate::business::{BusinessRules, SlotAvailability};
use crate::error::ApiResult;
use crate::middleware::CurrentSession;
use crate::validation::{parse_id, validate_child};

pub async fn list_children(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Paginated<ChildView>>> {
    let pagination = params.pagination()?;
    let children = state
        .storage
        .list_children_for_parent(current.user.id)?
        .into_iter()
        .map(ChildView::from)
        .collect();
    Ok(Json(Paginated::new(children, pagination)))
}

#[derive(Deserialize)]
pub struct ChildBody {
    pub name: Option<String>,
    pub age: Option<i64>,
    pub birthdate: Option<String>,
}

#[derive(Serialize)]
pub struct ChildResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    pub child: ChildView,
}

pub async fn add_child(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    JsonBody(body): JsonBody<ChildBody>,
) -> ApiResult<Json<ChildResponse>> {
    let name = body.name.unwrap_or_default();
    let birthdate = body.birthdate.filter(|b| !b.trim().is_empty());
    let age = validate_child(&name, birthdate.as_deref(), body.age)?;

    let child = state
        .storage
        .insert_child(current.user.id, name.trim().to_string(), age, birthdate)?;
    tracing::info!(child_id = child.id, parent_id = current.user.id, "child added");

    Ok(Json(ChildResponse {
        message: Some("Child added successfully"),
        child: child.into(),
    }))
}

pub async fn get_child(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<ChildResponse>> {
    let child_id = parse_id(&raw_id, "child_id")?;
    let child = BusinessRules::new(&state.storage).validate_child_ownership(child_id, current.user.id)?;
    Ok(Json(ChildResponse {
        message: None,
        child: child.into(),
    }))
}

/// Partial update. A new `age` without a `birthdate` drops the stored
/// birthdate; the merged record is validated as a whole.
pub async fn edit_child(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(raw_id): Path<String>,
    JsonBody(body): JsonBody<ChildBody>,
) -> ApiResult<Json<ChildResponse>> {
    let child_id = parse_id(&raw_id, "child_id")?;
    let mut child =
        BusinessRules::new(&state.storage).validate_child_ownership(child_id, current.user.id)?;

    let name = body.name.unwrap_or_else(|| child.name.clone());
    let birthdate = match (body.birthdate, body.age) {
        (Some(b), _) => Some(b).filter(|b| !b.trim().is_empty()),
        (None, Some(_)) => None,
        (None, None) => child.birthdate.clone(),
    };
    let age_hint = body.age.or(Some(i64::from(child.age)));
    let age = validate_child(&name, birthdate.as_deref(), age_hint)?;

    child.name = name.trim().to_string();
    child.birthdate = birthdate;
    child.age = age;
    state.storage.update_child(&child)?;
    tracing::info!(child_id, parent_id = current.user.id, "child updated");

    Ok(Json(ChildResponse {
        message: Some("Child updated successfully"),
        child: child.into(),
    }))
}

#[derive(Serialize)]
pub struct ChildDeletedResponse {
    pub message: &'static str,
    pub child_id: u64,
}

pub async fn delete_child(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<ChildDeletedResponse>> {
    let child_id = parse_id(&raw_id, "child_id")?;
    state
        .reservations
        .delete_child(&state.storage, current.user.id, child_id)?;

    Ok(Json(ChildDeletedResponse {
        message: "Child deleted successfully",
        child_id,
    }))
}

/// Missing ids decode as 0 so the shape check reports them.
#[derive(Deserialize)]
pub struct ReserveBody {
    #[serde(default)]
    pub child_id: u64,
    #[serde(default)]
    pub slot_id: u64,
}

#[derive(Serialize)]
pub struct ReserveResponse {
    pub message: &'static str,
    pub reservation: ReservationView,
    pub slot_availability: SlotAvailability,
}

pub async fn reserve(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    JsonBody(body): JsonBody<ReserveBody>,
) -> ApiResult<Json<ReserveResponse>> {
    let (reservation, availability) =
        state
            .reservations
            .create(&state.storage, current.user.id, body.child_id, body.slot_id)?;
    Ok(Json(ReserveResponse {
        message: "Reservation requested successfully",
        reservation: reservation.into(),
        slot_availability: availability,
    }))
}

pub async fn list_reservations(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Paginated<ReservationView>>> {
    let pagination = params.pagination()?;
    let status = params.status()?;

    let own: HashSet<u64> = state
        .storage
        .list_children_for_parent(current.user.id)?
        .into_iter()
        .map(|c| c.id)
        .collect();
    let reservations = state
        .storage
        .list_reservations()?
        .into_iter()
        .filter(|r| own.contains(&r.child_id))
        .filter(|r| status.map_or(true, |s| r.status == s))
        .map(ReservationView::from)
        .collect();
    Ok(Json(Paginated::new(reservations, pagination)))
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub message: &'static str,
    pub reservation_id: u64,
}

pub async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let reservation_id = parse_id(&raw_id, "reservation_id")?;
    state
        .reservations
        .cancel(&state.storage, current.user.id, reservation_id)?;
    Ok(Json(CancelResponse {
        message: "Reservation cancelled successfully",
        reservation_id,
    }))
}
