//! Sled-backed persistence for users, children, slots, reservations,
//! announcements, reset tokens and sessions.
//!
//! Every entity lives in its own tree, keyed by its big-endian `u64` id so
//! iteration follows creation order. Values are Serde JSON. Ids come from
//! `Db::generate_id` and start at 1, leaving 0 free to mean "absent" in
//! request bodies.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;

use crate::models::{
    Announcement, Child, PasswordResetToken, Reservation, ReservationStatus, Role, SessionRecord,
    Slot, User,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("email already registered: {0}")]
    DuplicateEmail(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Fields supplied when registering an account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

#[derive(Clone)] // Clone is cheap: Sled handles are reference counted
pub struct Storage {
    db: Db,
    users: Tree,
    // lowercase email -> user id, enforces uniqueness
    user_emails: Tree,
    children: Tree,
    slots: Tree,
    reservations: Tree,
    announcements: Tree,
    // token string -> PasswordResetToken
    reset_tokens: Tree,
    // session id -> SessionRecord
    sessions: Tree,
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn email_key(email: &str) -> Vec<u8> {
    email.trim().to_ascii_lowercase().into_bytes()
}

fn get_json<T: DeserializeOwned>(tree: &Tree, key: impl AsRef<[u8]>) -> StorageResult<Option<T>> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(tree: &Tree, key: impl AsRef<[u8]>, value: &T) -> StorageResult<()> {
    tree.insert(key.as_ref(), serde_json::to_vec(value)?)?;
    Ok(())
}

fn scan_json<T: DeserializeOwned>(tree: &Tree) -> StorageResult<Vec<T>> {
    let mut out = Vec::new();
    for item in tree.iter() {
        let (_, value) = item?;
        out.push(serde_json::from_slice(&value)?);
    }
    Ok(out)
}

impl Storage {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop. Used by tests and `TEST_MODE`.
    pub fn temporary() -> StorageResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        Ok(Self {
            users: db.open_tree("users")?,
            user_emails: db.open_tree("user_emails")?,
            children: db.open_tree("children")?,
            slots: db.open_tree("slots")?,
            reservations: db.open_tree("reservations")?,
            announcements: db.open_tree("announcements")?,
            reset_tokens: db.open_tree("reset_tokens")?,
            sessions: db.open_tree("sessions")?,
            db,
        })
    }

    fn next_id(&self) -> StorageResult<u64> {
        Ok(self.db.generate_id()? + 1)
    }

    pub async fn flush(&self) -> StorageResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    // --- Users ---

    /// Insert a user, claiming the email atomically.
    pub fn create_user(&self, new: NewUser) -> StorageResult<User> {
        let id = self.next_id()?;
        let claimed = self
            .user_emails
            .compare_and_swap(email_key(&new.email), None as Option<&[u8]>, Some(&id_key(id)[..]))?;
        if claimed.is_err() {
            return Err(StorageError::DuplicateEmail(new.email));
        }

        let user = User {
            id,
            email: new.email,
            password_hash: new.password_hash,
            role: new.role,
            session_version: 1,
            first_name: String::new(),
            last_name: String::new(),
            phone: String::new(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        put_json(&self.users, id_key(id), &user)?;
        Ok(user)
    }

    /// Active (not soft-deleted) user by id.
    pub fn get_user(&self, id: u64) -> StorageResult<Option<User>> {
        let user: Option<User> = get_json(&self.users, id_key(id))?;
        Ok(user.filter(User::is_active))
    }

    pub fn find_user_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        match self.user_emails.get(email_key(email))? {
            Some(raw) => {
                let mut buf = [0u8; 8];
                if raw.len() != buf.len() {
                    return Ok(None);
                }
                buf.copy_from_slice(&raw);
                self.get_user(u64::from_be_bytes(buf))
            }
            None => Ok(None),
        }
    }

    /// Apply `change` to the stored record of an active user and return the
    /// result. The write is a compare-and-swap against the record `change`
    /// saw, retried on conflict, so concurrent version bumps and soft deletes
    /// are never overwritten. An email change moves the uniqueness claim; a
    /// clash leaves the stored record untouched. `None` when no active user
    /// matched.
    pub fn modify_user<F>(&self, user_id: u64, mut change: F) -> StorageResult<Option<User>>
    where
        F: FnMut(&mut User),
    {
        let key = id_key(user_id);
        loop {
            let Some(raw) = self.users.get(key)? else {
                return Ok(None);
            };
            let current: User = serde_json::from_slice(&raw)?;
            if !current.is_active() {
                return Ok(None);
            }
            let mut next = current.clone();
            change(&mut next);
            next.id = user_id;

            let old_email = email_key(&current.email);
            let new_email = email_key(&next.email);
            let moved = old_email != new_email;
            if moved {
                let claimed = self.user_emails.compare_and_swap(
                    &new_email,
                    None as Option<&[u8]>,
                    Some(&key[..]),
                )?;
                if claimed.is_err() {
                    return Err(StorageError::DuplicateEmail(next.email));
                }
            }

            let swapped = self
                .users
                .compare_and_swap(key, Some(raw), Some(serde_json::to_vec(&next)?))?;
            match swapped {
                Ok(()) => {
                    if moved {
                        self.user_emails.remove(old_email)?;
                    }
                    return Ok(Some(next));
                }
                Err(_) => {
                    if moved {
                        // give the claim back before re-reading
                        let _ = self.user_emails.compare_and_swap(
                            &new_email,
                            Some(&key[..]),
                            None as Option<&[u8]>,
                        )?;
                    }
                }
            }
        }
    }

    /// Active users in id order.
    pub fn list_users(&self) -> StorageResult<Vec<User>> {
        let users: Vec<User> = scan_json(&self.users)?;
        Ok(users.into_iter().filter(User::is_active).collect())
    }

    /// Increment the user's session version, returning the new value.
    pub fn bump_session_version(&self, user_id: u64) -> StorageResult<Option<u64>> {
        let user = self.modify_user(user_id, |user| user.session_version += 1)?;
        Ok(user.map(|u| u.session_version))
    }

    /// Soft delete: keep the row, free the email, kill sessions and detach
    /// authored announcements. Returns false when no active user matched.
    pub fn soft_delete_user(&self, user_id: u64) -> StorageResult<bool> {
        let deleted_at = Utc::now();
        let Some(user) = self.modify_user(user_id, |user| {
            user.deleted_at = Some(deleted_at);
            user.session_version += 1;
        })?
        else {
            return Ok(false);
        };
        self.user_emails.remove(email_key(&user.email))?;

        for mut announcement in self.list_announcements()? {
            if announcement.author_id == Some(user_id) {
                announcement.author_id = None;
                put_json(&self.announcements, id_key(announcement.id), &announcement)?;
            }
        }
        self.delete_sessions_for_user(user_id)?;
        Ok(true)
    }

    // --- Children ---

    pub fn insert_child(
        &self,
        parent_id: u64,
        name: String,
        age: u8,
        birthdate: Option<String>,
    ) -> StorageResult<Child> {
        let child = Child {
            id: self.next_id()?,
            parent_id,
            name,
            age,
            birthdate,
            created_at: Utc::now(),
        };
        put_json(&self.children, id_key(child.id), &child)?;
        Ok(child)
    }

    pub fn get_child(&self, id: u64) -> StorageResult<Option<Child>> {
        get_json(&self.children, id_key(id))
    }

    pub fn update_child(&self, child: &Child) -> StorageResult<()> {
        put_json(&self.children, id_key(child.id), child)
    }

    /// Delete a child together with its reservations.
    pub fn delete_child(&self, id: u64) -> StorageResult<bool> {
        if self.children.remove(id_key(id))?.is_none() {
            return Ok(false);
        }
        for reservation in self.list_reservations()? {
            if reservation.child_id == id {
                self.reservations.remove(id_key(reservation.id))?;
            }
        }
        Ok(true)
    }

    pub fn list_children(&self) -> StorageResult<Vec<Child>> {
        scan_json(&self.children)
    }

    pub fn list_children_for_parent(&self, parent_id: u64) -> StorageResult<Vec<Child>> {
        Ok(self
            .list_children()?
            .into_iter()
            .filter(|c| c.parent_id == parent_id)
            .collect())
    }

    // --- Slots ---

    pub fn insert_slot(&self, date: String, capacity: u32) -> StorageResult<Slot> {
        let slot = Slot {
            id: self.next_id()?,
            date,
            capacity,
            created_at: Utc::now(),
        };
        put_json(&self.slots, id_key(slot.id), &slot)?;
        Ok(slot)
    }

    pub fn get_slot(&self, id: u64) -> StorageResult<Option<Slot>> {
        get_json(&self.slots, id_key(id))
    }

    pub fn update_slot(&self, slot: &Slot) -> StorageResult<()> {
        put_json(&self.slots, id_key(slot.id), slot)
    }

    /// Delete a slot together with its reservations.
    pub fn delete_slot(&self, id: u64) -> StorageResult<bool> {
        if self.slots.remove(id_key(id))?.is_none() {
            return Ok(false);
        }
        for reservation in self.list_reservations()? {
            if reservation.slot_id == id {
                self.reservations.remove(id_key(reservation.id))?;
            }
        }
        Ok(true)
    }

    pub fn list_slots(&self) -> StorageResult<Vec<Slot>> {
        scan_json(&self.slots)
    }

    // --- Reservations ---

    pub fn insert_reservation(&self, child_id: u64, slot_id: u64) -> StorageResult<Reservation> {
        let now = Utc::now();
        let reservation = Reservation {
            id: self.next_id()?,
            child_id,
            slot_id,
            status: ReservationStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        put_json(&self.reservations, id_key(reservation.id), &reservation)?;
        Ok(reservation)
    }

    pub fn get_reservation(&self, id: u64) -> StorageResult<Option<Reservation>> {
        get_json(&self.reservations, id_key(id))
    }

    pub fn update_reservation(&self, reservation: &Reservation) -> StorageResult<()> {
        put_json(&self.reservations, id_key(reservation.id), reservation)
    }

    pub fn delete_reservation(&self, id: u64) -> StorageResult<bool> {
        Ok(self.reservations.remove(id_key(id))?.is_some())
    }

    pub fn list_reservations(&self) -> StorageResult<Vec<Reservation>> {
        scan_json(&self.reservations)
    }

    /// Reservations on `slot_id` that still hold a seat.
    pub fn count_active_reservations(&self, slot_id: u64) -> StorageResult<u32> {
        let count = self
            .list_reservations()?
            .iter()
            .filter(|r| r.slot_id == slot_id && r.status.holds_seat())
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// The non-rejected reservation for this pair, if any.
    pub fn find_active_reservation(
        &self,
        child_id: u64,
        slot_id: u64,
    ) -> StorageResult<Option<Reservation>> {
        Ok(self
            .list_reservations()?
            .into_iter()
            .find(|r| r.child_id == child_id && r.slot_id == slot_id && r.status.holds_seat()))
    }

    // --- Announcements ---

    pub fn insert_announcement(
        &self,
        title: String,
        content: String,
        author_id: Option<u64>,
    ) -> StorageResult<Announcement> {
        let now = Utc::now();
        let announcement = Announcement {
            id: self.next_id()?,
            title,
            content,
            author_id,
            created_at: now,
            updated_at: now,
        };
        put_json(&self.announcements, id_key(announcement.id), &announcement)?;
        Ok(announcement)
    }

    pub fn get_announcement(&self, id: u64) -> StorageResult<Option<Announcement>> {
        get_json(&self.announcements, id_key(id))
    }

    pub fn update_announcement(&self, announcement: &Announcement) -> StorageResult<()> {
        put_json(&self.announcements, id_key(announcement.id), announcement)
    }

    pub fn delete_announcement(&self, id: u64) -> StorageResult<bool> {
        Ok(self.announcements.remove(id_key(id))?.is_some())
    }

    pub fn list_announcements(&self) -> StorageResult<Vec<Announcement>> {
        scan_json(&self.announcements)
    }

    // --- Password reset tokens ---

    pub fn put_reset_token(&self, token: &PasswordResetToken) -> StorageResult<()> {
        put_json(&self.reset_tokens, token.token.as_bytes(), token)
    }

    /// Remove and return the token. Single use: a second call yields `None`.
    pub fn take_reset_token(&self, token: &str) -> StorageResult<Option<PasswordResetToken>> {
        match self.reset_tokens.remove(token.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop every token expired at `now`. Returns how many were removed.
    pub fn purge_expired_reset_tokens(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let tokens: Vec<PasswordResetToken> = scan_json(&self.reset_tokens)?;
        let mut removed = 0;
        for token in tokens.iter().filter(|t| t.is_expired(now)) {
            self.reset_tokens.remove(token.token.as_bytes())?;
            removed += 1;
        }
        Ok(removed)
    }

    // --- Sessions ---

    pub fn put_session(&self, session: &SessionRecord) -> StorageResult<()> {
        put_json(&self.sessions, session.id.as_bytes(), session)
    }

    pub fn get_session(&self, id: &str) -> StorageResult<Option<SessionRecord>> {
        get_json(&self.sessions, id.as_bytes())
    }

    pub fn delete_session(&self, id: &str) -> StorageResult<()> {
        self.sessions.remove(id.as_bytes())?;
        Ok(())
    }

    /// Drop every session expired at `now`. Returns how many were removed.
    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let sessions: Vec<SessionRecord> = scan_json(&self.sessions)?;
        let mut removed = 0;
        for session in sessions.iter().filter(|s| now >= s.expires_at) {
            self.sessions.remove(session.id.as_bytes())?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn delete_sessions_for_user(&self, user_id: u64) -> StorageResult<usize> {
        let sessions: Vec<SessionRecord> = scan_json(&self.sessions)?;
        let mut removed = 0;
        for session in sessions.iter().filter(|s| s.user_id == user_id) {
            self.sessions.remove(session.id.as_bytes())?;
            removed += 1;
        }
        Ok(removed)
    }
}
