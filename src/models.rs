use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Parent,
    Admin,
}

impl Role {
    pub const ALL: [&'static str; 2] = ["parent", "admin"];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Parent => "parent",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parent" => Ok(Role::Parent),
            "admin" => Ok(Role::Admin),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a reservation. `Rejected` is terminal; `Approved` may still
/// be overridden to `Rejected`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReservationStatus {
    pub const ALL: [&'static str; 3] = ["pending", "approved", "rejected"];

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rejected => "rejected",
        }
    }

    /// Statuses reachable from `self` in one step.
    pub fn allowed_transitions(self) -> &'static [ReservationStatus] {
        match self {
            ReservationStatus::Pending => &[ReservationStatus::Approved, ReservationStatus::Rejected],
            ReservationStatus::Approved => &[ReservationStatus::Rejected],
            ReservationStatus::Rejected => &[],
        }
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Rejected reservations release their seat.
    pub fn holds_seat(self) -> bool {
        self != ReservationStatus::Rejected
    }
}

impl FromStr for ReservationStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReservationStatus::Pending),
            "approved" => Ok(ReservationStatus::Approved),
            "rejected" => Ok(ReservationStatus::Rejected),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: u64,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    /// Bumped to invalidate every outstanding session at once.
    pub session_version: u64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub phone: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Child {
    pub id: u64,
    pub parent_id: u64,
    pub name: String,
    pub age: u8,
    #[serde(default)]
    pub birthdate: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Slot {
    pub id: u64,
    /// `YYYY-MM-DD`
    pub date: String,
    pub capacity: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: u64,
    pub child_id: u64,
    pub slot_id: u64,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Announcement {
    pub id: u64,
    pub title: String,
    pub content: String,
    pub author_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Single-use password reset grant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PasswordResetToken {
    pub token: String,
    pub user_id: u64,
    pub expires_at: DateTime<Utc>,
}

impl PasswordResetToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Server-side half of a login session. The cookie only carries `id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: u64,
    /// Copy of `User::session_version` taken at login.
    pub session_version: u64,
    pub csrf_token: String,
    pub csrf_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
