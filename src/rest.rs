//! REST API layer for reservio using Axum
//!
//! One router, one handler set:
//! - `/api/auth/*`: registration, login, logout, password reset.
//! - `/api/user/*`, `/api/parent/*`, `/api/dashboard`: session + CSRF.
//! - `/api/admin/*`: session + admin role + CSRF, hidden from anonymous callers.
//!
//! Every request passes the per-IP throttle first (skipped in test mode).
//! - `/api/slots*`, `/api/announcements`, `/health`, `/version`: public.

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::mailer::Mailer;
use crate::middleware::{
    admin_gate, csrf_guard, require_admin_session, require_session, security_headers,
    throttle_requests,
};
use crate::models::{Announcement, Child, Reservation, ReservationStatus, Role, Slot, User};
use crate::rate_limit::{LoginAttemptTracker, RequestRateLimiter};
use crate::reservations::ReservationService;
use crate::session::{SessionManager, CSRF_HEADER};
use crate::storage::Storage;
use crate::validation::Pagination;

mod admin;
mod auth;
mod parent;
mod public;
mod user;

#[cfg(test)]
mod tests;

/// Shared app state for REST handlers (Arc-wrapped for concurrency)
pub struct AppState {
    pub storage: Storage,
    pub config: Config,
    pub sessions: SessionManager,
    pub login_attempts: LoginAttemptTracker,
    pub request_limiter: RequestRateLimiter,
    pub reservations: ReservationService,
    pub mailer: Arc<dyn Mailer>,
}

impl AppState {
    pub fn new(storage: Storage, config: Config, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            sessions: SessionManager::new(&config),
            storage,
            login_attempts: LoginAttemptTracker::new(),
            request_limiter: RequestRateLimiter::new(
                config.rate_limit_per_sec,
                config.rate_limit_burst,
            ),
            config,
            reservations: ReservationService::new(),
            mailer,
        }
    }
}

/// `Json` extractor whose rejections use the API error body.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                let rejection: JsonRejection = rejection;
                tracing::debug!(error = %rejection.body_text(), "rejected request body");
                Err(ApiError::invalid_input("Invalid JSON input"))
            }
        }
    }
}

/// Query parameters shared by the list endpoints. Kept as strings so bad
/// numbers surface as `INVALID_INPUT` rather than an extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<String>,
    pub per_page: Option<String>,
    pub status: Option<String>,
    pub slot_id: Option<String>,
}

impl ListParams {
    pub fn pagination(&self) -> ApiResult<Pagination> {
        crate::validation::parse_pagination(self.page.as_deref(), self.per_page.as_deref())
    }

    /// Parsed `status` filter; empty means no filter.
    pub fn status(&self) -> ApiResult<Option<ReservationStatus>> {
        match self.status.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => crate::validation::validate_status(raw).map(Some),
        }
    }
}

#[derive(Serialize)]
pub struct PageInfo {
    pub page: u32,
    pub per_page: u32,
    pub total: usize,
    pub total_pages: usize,
}

/// `{data, pagination}` envelope for list endpoints.
#[derive(Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub pagination: PageInfo,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, pagination: Pagination) -> Self {
        let (data, total) = pagination.apply(items);
        Self::with_total(data, pagination, total)
    }

    /// Wrap a page that was already sliced out of `total` items.
    pub fn with_total(data: Vec<T>, pagination: Pagination, total: usize) -> Self {
        let per_page = pagination.per_page as usize;
        Self {
            data,
            pagination: PageInfo {
                page: pagination.page,
                per_page: pagination.per_page,
                total,
                total_pages: total.div_ceil(per_page),
            },
        }
    }
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Serialize, Debug, Clone)]
pub struct UserView {
    pub id: u64,
    pub email: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            role: user.role,
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            phone: user.phone.clone(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ChildView {
    pub id: u64,
    pub name: String,
    pub age: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<String>,
}

impl From<Child> for ChildView {
    fn from(child: Child) -> Self {
        Self {
            id: child.id,
            name: child.name,
            age: child.age,
            birthdate: child.birthdate,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct SlotView {
    pub id: u64,
    pub date: String,
    pub capacity: u32,
}

impl From<Slot> for SlotView {
    fn from(slot: Slot) -> Self {
        Self {
            id: slot.id,
            date: slot.date,
            capacity: slot.capacity,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ReservationView {
    pub id: u64,
    pub child_id: u64,
    pub slot_id: u64,
    pub status: ReservationStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Reservation> for ReservationView {
    fn from(r: Reservation) -> Self {
        Self {
            id: r.id,
            child_id: r.child_id,
            slot_id: r.slot_id,
            status: r.status,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct AuthorView {
    pub id: u64,
    pub email: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct AnnouncementView {
    pub id: u64,
    pub title: String,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<AuthorView>,
}

impl AnnouncementView {
    /// Resolve the author; deleted authors are omitted.
    pub fn load(storage: &Storage, announcement: Announcement) -> ApiResult<Self> {
        let author = match announcement.author_id {
            Some(id) => storage.get_user(id)?.map(|u| AuthorView { id: u.id, email: u.email }),
            None => None,
        };
        Ok(Self {
            id: announcement.id,
            title: announcement.title,
            content: announcement.content,
            created_at: announcement.created_at,
            updated_at: announcement.updated_at,
            author,
        })
    }
}

/// bcrypt off the async workers.
pub(crate) async fn hash_password(state: &AppState, password: String) -> ApiResult<String> {
    let cost = state.config.bcrypt_cost;
    tokio::task::spawn_blocking(move || crate::auth::hash_password(&password, cost))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "hashing task failed");
            ApiError::internal("An internal error occurred")
        })?
        .map_err(|e| {
            tracing::error!(error = %e, "password hashing failed");
            ApiError::internal("An internal error occurred")
        })
}

pub(crate) async fn verify_password(password: String, hash: String) -> ApiResult<bool> {
    tokio::task::spawn_blocking(move || crate::auth::verify_password(&password, &hash))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "verify task failed");
            ApiError::internal("An internal error occurred")
        })?
        .or_else(|e| {
            // a malformed stored hash is a failed login, not a server error
            tracing::warn!(error = %e, "stored password hash unreadable");
            Ok(false)
        })
}

fn cors_layer(config: &Config) -> CorsLayer {
    let mut origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if config.test_mode {
        origins.push(HeaderValue::from_static("http://localhost:3000"));
        origins.push(HeaderValue::from_static("http://127.0.0.1:3000"));
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-csrf-token"),
        ])
        .expose_headers([CSRF_HEADER])
}

/// Create Axum router with every endpoint and the middleware stack
pub fn create_router(state: Arc<AppState>) -> Router {
    // route_layer: the last layer added runs first
    let session_routes = Router::new()
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/user/profile", get(user::get_profile).put(user::update_profile))
        .route("/api/user/csrf-token", get(user::csrf_token))
        .route("/api/user/logout-all", post(user::logout_all))
        .route("/api/dashboard", get(user::dashboard))
        .route("/api/parent/children", get(parent::list_children).post(parent::add_child))
        .route(
            "/api/parent/children/:id",
            get(parent::get_child)
                .put(parent::edit_child)
                .delete(parent::delete_child),
        )
        .route("/api/parent/reserve", post(parent::reserve))
        .route("/api/parent/reservations", get(parent::list_reservations))
        .route("/api/parent/reservations/:id", delete(parent::cancel_reservation))
        .route_layer(middleware::from_fn(csrf_guard))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    let admin_routes = Router::new()
        .route("/api/admin/slots", post(admin::create_slot))
        .route("/api/admin/slots/:id", put(admin::update_slot).delete(admin::delete_slot))
        .route("/api/admin/approve/:id", put(admin::approve_reservation))
        .route("/api/admin/reject/:id", put(admin::reject_reservation))
        .route("/api/admin/reservations", get(admin::list_reservations))
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/users/:id", delete(admin::delete_user))
        .route("/api/admin/users/:id/role", put(admin::update_user_role))
        .route("/api/admin/announcements", post(admin::create_announcement))
        .route(
            "/api/admin/announcements/:id",
            put(admin::update_announcement).delete(admin::delete_announcement),
        )
        .route_layer(middleware::from_fn(csrf_guard))
        .route_layer(middleware::from_fn(admin_gate))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_session));

    Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/request-reset", post(auth::request_reset))
        .route("/api/auth/reset-password", post(auth::reset_password))
        .route("/api/slots", get(public::list_slots))
        .route("/api/slots/calendar", get(public::slot_calendar))
        .route("/api/slots/:id", get(public::get_slot))
        .route("/api/announcements", get(public::list_announcements))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .merge(session_routes)
        .merge(admin_routes)
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(state.clone(), throttle_requests))
        .layer(middleware::from_fn_with_state(state.clone(), security_headers))
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Health check handler
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    commit: &'static str,
}

async fn version_handler() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT").unwrap_or("dev"),
    })
}

async fn not_found_handler() -> impl IntoResponse {
    ApiError::not_found("Resource not found")
}
