//! reservio: childcare-slot reservation backend
//!
//! Parents register children and request seats in dated slots; admins
//! review reservations, manage slot capacity, users and announcements.
//!
//! Layers, bottom-up: `storage` (Sled trees of JSON records), `validation`
//! and `business` (pure and store-backed checks), `reservations` (atomic
//! admission), `session`/`middleware` (cookie sessions, CSRF, roles) and
//! `rest` (Axum router).

pub mod auth;
pub mod business;
pub mod config;
pub mod error;
pub mod mailer;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod reservations;
// REST API module: Axum router and handlers
pub mod rest;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod validation;
