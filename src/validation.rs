//! Input-shape validation. Pure functions, no store access.
//!
//! Each check returns an [`ApiError`] carrying the field name and the
//! offending value so clients can point at the bad input.

use chrono::{Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::models::{ReservationStatus, Role};

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_CHILD_NAME_LEN: usize = 100;
pub const MAX_CHILD_AGE: i64 = 18;
pub const MIN_SLOT_CAPACITY: i64 = 1;
pub const MAX_SLOT_CAPACITY: i64 = 100;
pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;
pub const MAX_ANNOUNCEMENT_TITLE_LEN: usize = 200;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());
static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

fn is_present(value: &str) -> bool {
    !value.trim().is_empty()
}

pub fn validate_email(email: &str) -> ApiResult<()> {
    if !is_present(email) {
        return Err(ApiError::invalid_input("Email is required")
            .with_details(json!({ "field": "email", "value": email })));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(ApiError::invalid_input("Invalid email format")
            .with_details(json!({ "field": "email", "value": email })));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> ApiResult<()> {
    if password.is_empty() {
        return Err(ApiError::invalid_input("Password is required")
            .with_details(json!({ "field": "password" })));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(
            ApiError::invalid_input("Password must be at least 8 characters")
                .with_details(json!({ "field": "password", "min_length": MIN_PASSWORD_LEN })),
        );
    }
    Ok(())
}

/// Parse a `YYYY-MM-DD` string. `field` names the input in error details.
pub fn parse_date(value: &str, field: &str) -> ApiResult<NaiveDate> {
    if !DATE_RE.is_match(value) {
        return Err(ApiError::new(ErrorCode::InvalidDate, "Invalid date format. Use YYYY-MM-DD")
            .with_details(json!({ "field": field, "value": value, "format": "YYYY-MM-DD" })));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        ApiError::new(ErrorCode::InvalidDate, "Invalid date")
            .with_details(json!({ "field": field, "value": value }))
    })
}

/// Whole years between `birth` and `today`.
pub fn age_on(birth: NaiveDate, today: NaiveDate) -> i64 {
    let mut age = i64::from(today.year() - birth.year());
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age
}

fn age_error(field: &str, value: serde_json::Value) -> ApiError {
    ApiError::new(ErrorCode::InvalidAge, "Child age must be between 0 and 18")
        .with_details(json!({ "field": field, "value": value, "min": 0, "max": MAX_CHILD_AGE }))
}

pub fn validate_birthdate(birthdate: &str, today: NaiveDate) -> ApiResult<u8> {
    let birth = parse_date(birthdate, "birthdate")?;
    let age = age_on(birth, today);
    if !(0..=MAX_CHILD_AGE).contains(&age) {
        return Err(age_error("birthdate", json!(birthdate)));
    }
    Ok(age as u8)
}

/// Validate a child and resolve its age: from `birthdate` when given,
/// otherwise from the explicit `age`.
pub fn validate_child(name: &str, birthdate: Option<&str>, age: Option<i64>) -> ApiResult<u8> {
    validate_child_on(name, birthdate, age, Utc::now().date_naive())
}

pub fn validate_child_on(
    name: &str,
    birthdate: Option<&str>,
    age: Option<i64>,
    today: NaiveDate,
) -> ApiResult<u8> {
    if !is_present(name) {
        return Err(ApiError::invalid_input("Child name is required")
            .with_details(json!({ "field": "name" })));
    }
    if name.chars().count() > MAX_CHILD_NAME_LEN {
        return Err(
            ApiError::invalid_input("Child name is too long (max 100 characters)")
                .with_details(json!({ "field": "name", "max_length": MAX_CHILD_NAME_LEN })),
        );
    }
    if let Some(birthdate) = birthdate.filter(|b| is_present(b)) {
        return validate_birthdate(birthdate, today);
    }
    match age {
        Some(age) if (0..=MAX_CHILD_AGE).contains(&age) => Ok(age as u8),
        Some(age) => Err(age_error("age", json!(age))),
        None => Err(ApiError::invalid_input("Either birthdate or age is required")),
    }
}

pub fn validate_capacity(capacity: i64) -> ApiResult<u32> {
    if !(MIN_SLOT_CAPACITY..=MAX_SLOT_CAPACITY).contains(&capacity) {
        return Err(ApiError::new(
            ErrorCode::InvalidCapacity,
            "Slot capacity must be between 1 and 100",
        )
        .with_details(json!({
            "field": "capacity",
            "value": capacity,
            "min": MIN_SLOT_CAPACITY,
            "max": MAX_SLOT_CAPACITY,
        })));
    }
    Ok(capacity as u32)
}

pub fn validate_slot(date: &str, capacity: i64) -> ApiResult<u32> {
    validate_slot_on(date, capacity, Utc::now().date_naive())
}

pub fn validate_slot_on(date: &str, capacity: i64, today: NaiveDate) -> ApiResult<u32> {
    if !is_present(date) {
        return Err(ApiError::invalid_input("Slot date is required")
            .with_details(json!({ "field": "date", "value": date })));
    }
    let parsed = parse_date(date, "date")?;
    if parsed < today {
        return Err(
            ApiError::new(ErrorCode::InvalidDate, "Slot date cannot be in the past")
                .with_details(json!({ "field": "date", "value": date })),
        );
    }
    validate_capacity(capacity)
}

pub fn validate_reservation(child_id: u64, slot_id: u64) -> ApiResult<()> {
    if child_id == 0 {
        return Err(ApiError::invalid_input("Child ID is required")
            .with_details(json!({ "field": "child_id", "value": child_id })));
    }
    if slot_id == 0 {
        return Err(ApiError::invalid_input("Slot ID is required")
            .with_details(json!({ "field": "slot_id", "value": slot_id })));
    }
    Ok(())
}

pub fn validate_role(role: &str) -> ApiResult<Role> {
    role.parse().map_err(|_| {
        ApiError::new(ErrorCode::InvalidRole, "Invalid role. Must be 'parent' or 'admin'")
            .with_details(json!({ "field": "role", "value": role, "valid_roles": Role::ALL }))
    })
}

pub fn validate_status(status: &str) -> ApiResult<ReservationStatus> {
    status.parse().map_err(|_| {
        ApiError::new(
            ErrorCode::InvalidStatus,
            "Invalid status. Must be 'pending', 'approved', or 'rejected'",
        )
        .with_details(json!({
            "field": "status",
            "value": status,
            "valid_statuses": ReservationStatus::ALL,
        }))
    })
}

pub fn validate_announcement(title: &str, content: &str) -> ApiResult<()> {
    if !is_present(title) {
        return Err(ApiError::invalid_input("Title is required")
            .with_details(json!({ "field": "title" })));
    }
    if title.chars().count() > MAX_ANNOUNCEMENT_TITLE_LEN {
        return Err(ApiError::invalid_input("Title is too long (max 200 characters)")
            .with_details(json!({ "field": "title", "max_length": MAX_ANNOUNCEMENT_TITLE_LEN })));
    }
    if !is_present(content) {
        return Err(ApiError::invalid_input("Content is required")
            .with_details(json!({ "field": "content" })));
    }
    Ok(())
}

/// Validated page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE as u32,
            per_page: DEFAULT_PER_PAGE as u32,
        }
    }
}

impl Pagination {
    pub fn offset(&self) -> usize {
        (self.page as usize - 1) * self.per_page as usize
    }

    /// Slice one page out of `items`, returning it with the total count.
    pub fn apply<T>(&self, items: Vec<T>) -> (Vec<T>, usize) {
        let total = items.len();
        let page = items
            .into_iter()
            .skip(self.offset())
            .take(self.per_page as usize)
            .collect();
        (page, total)
    }
}

pub fn validate_pagination(page: i64, per_page: i64) -> ApiResult<Pagination> {
    if page < 1 {
        return Err(ApiError::invalid_input("Page must be greater than 0")
            .with_details(json!({ "field": "page", "value": page, "min": 1 })));
    }
    if !(1..=MAX_PER_PAGE).contains(&per_page) {
        return Err(ApiError::invalid_input("Per page must be between 1 and 100")
            .with_details(json!({ "field": "per_page", "value": per_page, "min": 1, "max": MAX_PER_PAGE })));
    }
    Ok(Pagination {
        page: u32::try_from(page).unwrap_or(u32::MAX),
        per_page: per_page as u32,
    })
}

/// Parse raw query-string values, applying defaults for missing ones.
pub fn parse_pagination(page: Option<&str>, per_page: Option<&str>) -> ApiResult<Pagination> {
    let parse = |raw: Option<&str>, field: &str, default: i64| -> ApiResult<i64> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(default),
            Some(s) => s.parse().map_err(|_| {
                ApiError::invalid_input(format!("Invalid {field} number"))
                    .with_details(json!({ "field": field, "value": s }))
            }),
        }
    };
    let page = parse(page, "page", DEFAULT_PAGE)?;
    let per_page = parse(per_page, "per_page", DEFAULT_PER_PAGE)?;
    validate_pagination(page, per_page)
}

/// Parse a positive id from a path segment.
pub fn parse_id(raw: &str, field: &str) -> ApiResult<u64> {
    match raw.parse::<u64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::invalid_id(field, raw)),
    }
}
