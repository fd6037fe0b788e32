//! Reservation admission and lifecycle.
//!
//! Creation runs the checks in a fixed order (ownership, slot, capacity,
//! double booking) and inserts while holding the admission lock, so the
//! last seat of a slot can only be taken once.

use chrono::Utc;
use std::sync::{Mutex, MutexGuard};

use crate::business::{BusinessRules, SlotAvailability};
use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::models::{Reservation, ReservationStatus, Slot};
use crate::storage::Storage;
use crate::validation::validate_reservation;

#[derive(Debug, Default)]
pub struct ReservationService {
    admission: Mutex<()>,
}

impl ReservationService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // the guarded value is (), a poisoned lock carries no broken state
        self.admission.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request a seat for `child_id` on `slot_id` on behalf of `parent_id`.
    /// Returns the pending reservation and the slot's availability after it.
    pub fn create(
        &self,
        storage: &Storage,
        parent_id: u64,
        child_id: u64,
        slot_id: u64,
    ) -> ApiResult<(Reservation, SlotAvailability)> {
        validate_reservation(child_id, slot_id)?;
        let rules = BusinessRules::new(storage);

        let _guard = self.lock();
        rules.validate_child_ownership(child_id, parent_id)?;
        rules.validate_slot_exists(slot_id)?;
        rules.validate_slot_capacity(slot_id)?;
        rules.validate_double_booking(child_id, slot_id)?;

        let reservation = storage.insert_reservation(child_id, slot_id)?;
        let availability = rules.get_slot_availability(slot_id)?;
        tracing::info!(
            reservation_id = reservation.id,
            child_id,
            slot_id,
            available = availability.available,
            "reservation requested"
        );
        Ok((reservation, availability))
    }

    /// Admin transition to `next` (approve or reject).
    pub fn transition(
        &self,
        storage: &Storage,
        reservation_id: u64,
        next: ReservationStatus,
    ) -> ApiResult<Reservation> {
        let _guard = self.lock();
        let mut reservation = storage.get_reservation(reservation_id)?.ok_or_else(|| {
            ApiError::new(ErrorCode::ReservationNotFound, "Reservation not found")
                .with_details(serde_json::json!({ "reservation_id": reservation_id }))
        })?;
        BusinessRules::new(storage)
            .validate_reservation_status_transition(reservation.status, next)?;

        let previous = reservation.status;
        reservation.status = next;
        reservation.updated_at = Utc::now();
        storage.update_reservation(&reservation)?;
        tracing::info!(reservation_id, from = %previous, to = %next, "reservation status changed");
        Ok(reservation)
    }

    /// Change a slot's capacity. Never below the seats already held.
    pub fn resize_slot(&self, storage: &Storage, slot_id: u64, capacity: u32) -> ApiResult<Slot> {
        let _guard = self.lock();
        let rules = BusinessRules::new(storage);
        let mut slot = rules.validate_slot_exists(slot_id)?;
        let booked = storage.count_active_reservations(slot_id)?;
        if capacity < booked {
            return Err(ApiError::new(
                ErrorCode::InvalidCapacity,
                "Capacity cannot be lower than current bookings",
            )
            .with_details(serde_json::json!({
                "slot_id": slot_id,
                "capacity": capacity,
                "booked": booked,
            })));
        }
        slot.capacity = capacity;
        storage.update_slot(&slot)?;
        tracing::info!(slot_id, capacity, booked, "slot resized");
        Ok(slot)
    }

    /// Delete a slot and its reservations. Holding the lock keeps an
    /// admission from landing on a slot that is being removed.
    pub fn delete_slot(&self, storage: &Storage, slot_id: u64) -> ApiResult<()> {
        let _guard = self.lock();
        if !storage.delete_slot(slot_id)? {
            return Err(ApiError::new(ErrorCode::SlotNotFound, "Slot not found")
                .with_details(serde_json::json!({ "slot_id": slot_id })));
        }
        tracing::info!(slot_id, "slot deleted");
        Ok(())
    }

    /// Delete one of `parent_id`'s children and its reservations.
    pub fn delete_child(&self, storage: &Storage, parent_id: u64, child_id: u64) -> ApiResult<()> {
        let _guard = self.lock();
        BusinessRules::new(storage).validate_child_ownership(child_id, parent_id)?;
        storage.delete_child(child_id)?;
        tracing::info!(child_id, parent_id, "child deleted");
        Ok(())
    }

    /// Parent cancellation: deletes the reservation outright.
    pub fn cancel(&self, storage: &Storage, parent_id: u64, reservation_id: u64) -> ApiResult<()> {
        let _guard = self.lock();
        BusinessRules::new(storage).validate_reservation_ownership(reservation_id, parent_id)?;
        storage.delete_reservation(reservation_id)?;
        tracing::info!(reservation_id, parent_id, "reservation cancelled");
        Ok(())
    }
}
