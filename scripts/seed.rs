//! Seed script for reservio
//!
//! Populates the store with:
//! - an admin account (SEED_ADMIN_EMAIL / SEED_ADMIN_PASSWORD)
//! - one slot per weekday for the next two weeks
//!
//! Run: cargo run --bin seed
//! Safe to re-run: an existing admin is kept, dates that already have a slot
//! are skipped.

use chrono::{Datelike, Duration, Utc, Weekday};
use std::collections::HashSet;
use std::env;

use reservio::auth::hash_password;
use reservio::config::Config;
use reservio::models::Role;
use reservio::storage::{NewUser, Storage};
use reservio::telemetry::init_tracing;
use reservio::validation::{validate_email, validate_password};

const DEFAULT_CAPACITY: u32 = 10;
const DAYS_AHEAD: i64 = 14;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "reservio_data".to_string());
    let bcrypt_cost = Config::from_env().map(|c| c.bcrypt_cost).unwrap_or(bcrypt::DEFAULT_COST);
    let storage = Storage::open(&data_dir)?;

    let email = env::var("SEED_ADMIN_EMAIL").unwrap_or_else(|_| "admin@example.com".to_string());
    let password = env::var("SEED_ADMIN_PASSWORD").unwrap_or_else(|_| "admin12345".to_string());
    validate_email(&email)?;
    validate_password(&password)?;

    match storage.find_user_by_email(&email)? {
        Some(user) if user.is_admin() => {
            tracing::info!(user_id = user.id, %email, "admin already present");
        }
        Some(user) => {
            storage.modify_user(user.id, |user| user.role = Role::Admin)?;
            tracing::info!(user_id = user.id, %email, "existing account promoted to admin");
        }
        None => {
            let user = storage.create_user(NewUser {
                email: email.clone(),
                password_hash: hash_password(&password, bcrypt_cost)?,
                role: Role::Admin,
            })?;
            tracing::info!(user_id = user.id, %email, "admin created");
        }
    }

    let existing: HashSet<String> = storage.list_slots()?.into_iter().map(|s| s.date).collect();
    let today = Utc::now().date_naive();
    let mut created = 0;
    for offset in 1..=DAYS_AHEAD {
        let day = today + Duration::days(offset);
        if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            continue;
        }
        let date = day.format("%Y-%m-%d").to_string();
        if existing.contains(&date) {
            continue;
        }
        storage.insert_slot(date, DEFAULT_CAPACITY)?;
        created += 1;
    }
    tracing::info!(created, capacity = DEFAULT_CAPACITY, "slots seeded");

    storage.flush().await?;
    Ok(())
}
