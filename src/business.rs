//! Store-backed admission checks. Every check is read-only; a passing check
//! leaves the store untouched.

use serde::Serialize;
use std::collections::HashMap;
use serde_json::json;

use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::models::{Child, Reservation, ReservationStatus, Slot};
use crate::storage::Storage;

/// Seat accounting for one slot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SlotAvailability {
    pub slot_id: u64,
    pub capacity: u32,
    pub booked: u32,
    pub available: u32,
    pub is_full: bool,
}

impl SlotAvailability {
    pub fn new(slot: &Slot, booked: u32) -> Self {
        let available = slot.capacity.saturating_sub(booked);
        Self {
            slot_id: slot.id,
            capacity: slot.capacity,
            booked,
            available,
            is_full: available == 0,
        }
    }
}

pub struct BusinessRules<'a> {
    storage: &'a Storage,
}

impl<'a> BusinessRules<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// The child exists and belongs to `parent_id`. Someone else's child is
    /// reported as missing.
    pub fn validate_child_ownership(&self, child_id: u64, parent_id: u64) -> ApiResult<Child> {
        match self.storage.get_child(child_id)? {
            Some(child) if child.parent_id == parent_id => Ok(child),
            _ => Err(ApiError::new(
                ErrorCode::ChildNotFound,
                "Child not found or does not belong to you",
            )
            .with_details(json!({ "child_id": child_id }))),
        }
    }

    pub fn validate_slot_exists(&self, slot_id: u64) -> ApiResult<Slot> {
        self.storage.get_slot(slot_id)?.ok_or_else(|| {
            ApiError::new(ErrorCode::SlotNotFound, "Slot not found")
                .with_details(json!({ "slot_id": slot_id }))
        })
    }

    pub fn validate_slot_capacity(&self, slot_id: u64) -> ApiResult<SlotAvailability> {
        let availability = self.get_slot_availability(slot_id)?;
        if availability.is_full {
            return Err(ApiError::new(ErrorCode::SlotFull, "This slot is fully booked")
                .with_details(json!({
                    "slot_id": slot_id,
                    "capacity": availability.capacity,
                    "booked": availability.booked,
                })));
        }
        Ok(availability)
    }

    pub fn validate_double_booking(&self, child_id: u64, slot_id: u64) -> ApiResult<()> {
        if let Some(existing) = self.storage.find_active_reservation(child_id, slot_id)? {
            return Err(ApiError::new(
                ErrorCode::DoubleBooking,
                "This child already has a reservation for this slot",
            )
            .with_details(json!({
                "child_id": child_id,
                "slot_id": slot_id,
                "existing_reservation_id": existing.id,
                "existing_status": existing.status,
            })));
        }
        Ok(())
    }

    /// The reservation exists and its child belongs to `parent_id`.
    pub fn validate_reservation_ownership(
        &self,
        reservation_id: u64,
        parent_id: u64,
    ) -> ApiResult<Reservation> {
        let not_found = || {
            ApiError::new(
                ErrorCode::ReservationNotFound,
                "Reservation not found or does not belong to you",
            )
            .with_details(json!({ "reservation_id": reservation_id }))
        };
        let reservation = self
            .storage
            .get_reservation(reservation_id)?
            .ok_or_else(not_found)?;
        match self.storage.get_child(reservation.child_id)? {
            Some(child) if child.parent_id == parent_id => Ok(reservation),
            _ => Err(not_found()),
        }
    }

    pub fn validate_reservation_status_transition(
        &self,
        current: ReservationStatus,
        next: ReservationStatus,
    ) -> ApiResult<()> {
        validate_transition(current, next)
    }

    /// Seat-holding reservations per slot, from a single scan.
    pub fn booked_counts(&self) -> ApiResult<HashMap<u64, u32>> {
        let mut counts = HashMap::new();
        for reservation in self.storage.list_reservations()? {
            if reservation.status.holds_seat() {
                *counts.entry(reservation.slot_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    pub fn get_slot_availability(&self, slot_id: u64) -> ApiResult<SlotAvailability> {
        let slot = self.validate_slot_exists(slot_id)?;
        let booked = self.storage.count_active_reservations(slot_id)?;
        Ok(SlotAvailability::new(&slot, booked))
    }
}

pub fn validate_transition(current: ReservationStatus, next: ReservationStatus) -> ApiResult<()> {
    if current.can_transition_to(next) {
        return Ok(());
    }
    let allowed: Vec<&str> = current
        .allowed_transitions()
        .iter()
        .map(|s| s.as_str())
        .collect();
    Err(ApiError::new(
        ErrorCode::InvalidStatus,
        format!("Cannot change status from {current} to {next}"),
    )
    .with_details(json!({
        "current_status": current,
        "requested_status": next,
        "allowed_transitions": allowed,
    })))
}
