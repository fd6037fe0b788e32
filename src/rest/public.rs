//! Anonymous read-only endpoints: slot listing and announcements.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{AnnouncementView, AppState, ListParams, Paginated, SlotView};
use crate::business::{BusinessRules, SlotAvailability};
use crate::error::ApiResult;
use crate::models::Slot;
use crate::validation::parse_id;

#[derive(Serialize, Debug)]
pub struct SlotListItem {
    pub id: u64,
    pub date: String,
    #[serde(flatten)]
    pub availability: SlotAvailability,
}

/// Slots by date, then id.
fn sorted_slots(state: &AppState) -> ApiResult<Vec<Slot>> {
    let mut slots = state.storage.list_slots()?;
    slots.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
    Ok(slots)
}

pub async fn list_slots(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Paginated<SlotListItem>>> {
    let pagination = params.pagination()?;
    let booked = BusinessRules::new(&state.storage).booked_counts()?;
    let items = sorted_slots(&state)?
        .into_iter()
        .map(|slot| {
            let availability =
                SlotAvailability::new(&slot, booked.get(&slot.id).copied().unwrap_or(0));
            SlotListItem {
                id: slot.id,
                date: slot.date,
                availability,
            }
        })
        .collect();
    Ok(Json(Paginated::new(items, pagination)))
}

#[derive(Serialize)]
pub struct SlotDetailResponse {
    pub slot: SlotView,
    pub availability: SlotAvailability,
}

pub async fn get_slot(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<SlotDetailResponse>> {
    let slot_id = parse_id(&raw_id, "slot_id")?;
    let rules = BusinessRules::new(&state.storage);
    let slot = rules.validate_slot_exists(slot_id)?;
    let availability = rules.get_slot_availability(slot_id)?;
    Ok(Json(SlotDetailResponse {
        slot: slot.into(),
        availability,
    }))
}

#[derive(Serialize, Debug)]
pub struct CalendarEntry {
    pub id: u64,
    pub date: String,
    pub capacity: u32,
    pub remaining: u32,
}

#[derive(Serialize)]
pub struct CalendarResponse {
    pub calendar: BTreeMap<String, Vec<CalendarEntry>>,
}

pub async fn slot_calendar(State(state): State<Arc<AppState>>) -> ApiResult<Json<CalendarResponse>> {
    let booked = BusinessRules::new(&state.storage).booked_counts()?;
    let mut calendar: BTreeMap<String, Vec<CalendarEntry>> = BTreeMap::new();
    for slot in sorted_slots(&state)? {
        let taken = booked.get(&slot.id).copied().unwrap_or(0);
        calendar.entry(slot.date.clone()).or_default().push(CalendarEntry {
            id: slot.id,
            remaining: slot.capacity.saturating_sub(taken),
            capacity: slot.capacity,
            date: slot.date,
        });
    }
    Ok(Json(CalendarResponse { calendar }))
}

/// Newest first.
pub async fn list_announcements(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Paginated<AnnouncementView>>> {
    let pagination = params.pagination()?;
    let mut announcements = state.storage.list_announcements()?;
    announcements.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

    let (page, total) = pagination.apply(announcements);
    let views = page
        .into_iter()
        .map(|a| AnnouncementView::load(&state.storage, a))
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(Paginated::with_total(views, pagination, total)))
}
