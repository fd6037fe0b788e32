//! End-to-end tests against the full router, driven with `oneshot`.

use axum::{
    body::{to_bytes, Body},
    http::{header, request::Builder, HeaderMap, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // For .oneshot() testing

use super::{create_router, AppState};
use crate::config::Config;
use crate::mailer::MemoryMailer;
use crate::models::Role;
use crate::session::CSRF_HEADER;
use crate::storage::{NewUser, Storage};

const PASSWORD: &str = "password123";

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    mailer: Arc<MemoryMailer>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(Config::for_tests())
    }

    fn with_config(config: Config) -> Self {
        let storage = Storage::temporary().expect("temporary store");
        let mailer = Arc::new(MemoryMailer::new());
        let state = Arc::new(AppState::new(storage, config, mailer.clone()));
        Self {
            router: create_router(state.clone()),
            state,
            mailer,
        }
    }

    fn client(&self) -> TestClient {
        TestClient {
            router: self.router.clone(),
            cookie: None,
            csrf: None,
        }
    }

    /// Admin accounts cannot be registered over HTTP; create one in the store.
    async fn admin(&self, email: &str) -> TestClient {
        self.state
            .storage
            .create_user(NewUser {
                email: email.into(),
                password_hash: crate::auth::hash_password(PASSWORD, 4).unwrap(),
                role: Role::Admin,
            })
            .unwrap();
        self.login(email, PASSWORD).await
    }

    async fn parent(&self, email: &str) -> TestClient {
        let mut client = self.client();
        let res = client
            .post("/api/auth/register", json!({ "email": email, "password": PASSWORD }))
            .await;
        assert_eq!(res.status, StatusCode::OK, "register {email}: {}", res.body);
        client
    }

    async fn login(&self, email: &str, password: &str) -> TestClient {
        let mut client = self.client();
        let res = client
            .post("/api/auth/login", json!({ "email": email, "password": password }))
            .await;
        assert_eq!(res.status, StatusCode::OK, "login {email}: {}", res.body);
        client
    }

    fn user_id(&self, email: &str) -> u64 {
        self.state.storage.find_user_by_email(email).unwrap().unwrap().id
    }
}

struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl TestResponse {
    fn code(&self) -> &str {
        self.body["code"].as_str().unwrap_or("")
    }

    fn id(&self, key: &str) -> u64 {
        self.body[key]["id"].as_u64().unwrap()
    }
}

/// Browser stand-in: keeps the session cookie and echoes the CSRF token.
struct TestClient {
    router: Router,
    cookie: Option<String>,
    csrf: Option<String>,
}

impl TestClient {
    async fn get(&mut self, uri: &str) -> TestResponse {
        self.send(Method::GET, uri, None).await
    }

    async fn post(&mut self, uri: &str, body: Value) -> TestResponse {
        self.send(Method::POST, uri, Some(body)).await
    }

    async fn put(&mut self, uri: &str, body: Value) -> TestResponse {
        self.send(Method::PUT, uri, Some(body)).await
    }

    async fn delete(&mut self, uri: &str) -> TestResponse {
        self.send(Method::DELETE, uri, None).await
    }

    async fn send(&mut self, method: Method, uri: &str, body: Option<Value>) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        if let Some(csrf) = &self.csrf {
            builder = builder.header(CSRF_HEADER, csrf.as_str());
        }
        self.dispatch(builder, body).await
    }

    async fn dispatch(&mut self, mut builder: Builder, body: Body) -> TestResponse {
        if let Some(cookie) = &self.cookie {
            builder = builder.header(header::COOKIE, cookie.as_str());
        }
        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        if let Some(set) = headers.get(header::SET_COOKIE).and_then(|v| v.to_str().ok()) {
            let pair = set.split(';').next().unwrap_or_default();
            self.cookie = if pair.ends_with('=') { None } else { Some(pair.to_string()) };
        }
        if let Some(token) = headers.get(&CSRF_HEADER).and_then(|v| v.to_str().ok()) {
            self.csrf = Some(token.to_string());
        }
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }
}

async fn add_child(client: &mut TestClient, name: &str, age: i64) -> u64 {
    let res = client
        .post("/api/parent/children", json!({ "name": name, "age": age }))
        .await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    res.id("child")
}

async fn create_slot(admin: &mut TestClient, date: &str, capacity: u32) -> u64 {
    let res = admin
        .post("/api/admin/slots", json!({ "date": date, "capacity": capacity }))
        .await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    res.id("slot")
}

async fn reserve(client: &mut TestClient, child_id: u64, slot_id: u64) -> TestResponse {
    client
        .post("/api/parent/reserve", json!({ "child_id": child_id, "slot_id": slot_id }))
        .await
}

#[tokio::test]
async fn health_version_and_unknown_routes() {
    let app = TestApp::new();
    let mut anon = app.client();

    let res = anon.get("/health").await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["status"], "ok");
    assert_eq!(res.headers["x-content-type-options"], "nosniff");
    assert_eq!(res.headers["x-frame-options"], "DENY");
    assert!(res.headers.contains_key(header::CONTENT_SECURITY_POLICY));
    assert!(!res.headers.contains_key(header::STRICT_TRANSPORT_SECURITY));

    let res = anon.get("/version").await;
    assert_eq!(res.body["version"], env!("CARGO_PKG_VERSION"));

    let res = anon.get("/api/nope").await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.code(), "NOT_FOUND");
}

#[tokio::test]
async fn register_login_and_add_child() {
    let app = TestApp::new();
    let mut client = app.parent("a@x.com").await;
    assert!(client.cookie.is_some());
    assert!(client.csrf.is_some());

    let mut client2 = app.login("a@x.com", PASSWORD).await;
    let res = client2
        .post("/api/parent/children", json!({ "name": "Kid", "age": 5 }))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert!(res.id("child") > 0);
    assert_eq!(res.body["child"]["age"], 5);

    let res = client2
        .post("/api/parent/children", json!({ "name": "", "age": 5 }))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_INPUT");

    // the registration session is still good
    let res = client.get("/api/parent/children").await;
    assert_eq!(res.body["pagination"]["total"], 1);
}

#[tokio::test]
async fn registration_rejects_bad_input_and_duplicates() {
    let app = TestApp::new();
    app.parent("a@x.com").await;
    let mut anon = app.client();

    let res = anon
        .post("/api/auth/register", json!({ "email": "a@x.com", "password": PASSWORD }))
        .await;
    assert_eq!(res.status, StatusCode::CONFLICT);
    assert_eq!(res.code(), "DUPLICATE_EMAIL");

    let res = anon
        .post("/api/auth/register", json!({ "email": "not-an-email", "password": PASSWORD }))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = anon
        .post("/api/auth/register", json!({ "email": "b@x.com", "password": "short" }))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert!(anon.cookie.is_none());

    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/auth/register");
    builder = builder.header(header::CONTENT_TYPE, "application/json");
    let res = anon.dispatch(builder, Body::from("{not json")).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], "Invalid JSON input");
}

#[tokio::test]
async fn children_are_visible_only_to_their_parent() {
    let app = TestApp::new();
    let mut alice = app.parent("alice@x.com").await;
    let mut bob = app.parent("bob@x.com").await;
    let child = add_child(&mut alice, "Kid", 4).await;

    let res = alice.get(&format!("/api/parent/children/{child}")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["child"]["name"], "Kid");

    let res = bob.get(&format!("/api/parent/children/{child}")).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.code(), "CHILD_NOT_FOUND");
    let res = bob
        .put(&format!("/api/parent/children/{child}"), json!({ "name": "Mine" }))
        .await;
    assert_eq!(res.code(), "CHILD_NOT_FOUND");
    let res = bob.delete(&format!("/api/parent/children/{child}")).await;
    assert_eq!(res.code(), "CHILD_NOT_FOUND");

    let res = bob.get("/api/parent/children").await;
    assert_eq!(res.body["data"], json!([]));

    let res = alice.get("/api/parent/children/abc").await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_INPUT");
}

#[tokio::test]
async fn child_edit_merges_and_revalidates() {
    let app = TestApp::new();
    let mut alice = app.parent("alice@x.com").await;
    let child = add_child(&mut alice, "Kid", 4).await;
    let uri = format!("/api/parent/children/{child}");

    let res = alice.put(&uri, json!({ "age": 7 })).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["child"]["age"], 7);
    assert_eq!(res.body["child"]["name"], "Kid");

    let res = alice.put(&uri, json!({ "age": 30 })).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_AGE");

    let res = alice.put(&uri, json!({ "birthdate": "not-a-date" })).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = alice.put(&uri, json!({ "name": "Renamed" })).await;
    assert_eq!(res.body["child"]["name"], "Renamed");
    assert_eq!(res.body["child"]["age"], 7);

    let res = alice.delete(&uri).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["child_id"], child);
    assert_eq!(alice.get(&uri).await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn csrf_is_required_for_state_changes() {
    let app = TestApp::new();
    let mut alice = app.parent("alice@x.com").await;
    let token = alice.csrf.clone().unwrap();

    // reads are exempt
    alice.csrf = None;
    assert_eq!(alice.get("/api/parent/children").await.status, StatusCode::OK);

    // every authenticated response re-announces the token; forget it again
    alice.csrf = None;
    let res = alice
        .post("/api/parent/children", json!({ "name": "Kid", "age": 4 }))
        .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.code(), "CSRF_INVALID");

    alice.csrf = Some("forged".into());
    let res = alice
        .post("/api/parent/children", json!({ "name": "Kid", "age": 4 }))
        .await;
    assert_eq!(res.code(), "CSRF_INVALID");

    // form field fallback: the guard passes, the JSON extractor then refuses the form
    alice.csrf = None;
    let builder = Request::builder()
        .method(Method::POST)
        .uri("/api/parent/children")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    let res = alice
        .dispatch(builder, Body::from(format!("name=Kid&csrf_token={token}")))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_INPUT");

    alice.csrf = Some(token);
    add_child(&mut alice, "Kid", 4).await;
}

#[tokio::test]
async fn csrf_rotation_invalidates_old_token() {
    let app = TestApp::new();
    let mut alice = app.parent("alice@x.com").await;
    let old = alice.csrf.clone().unwrap();

    let res = alice.get("/api/user/csrf-token").await;
    assert_eq!(res.status, StatusCode::OK);
    let new = res.body["csrf_token"].as_str().unwrap().to_string();
    assert_ne!(new, old);
    assert_eq!(alice.csrf.as_deref(), Some(new.as_str()));

    alice.csrf = Some(old);
    let res = alice
        .post("/api/parent/children", json!({ "name": "Kid", "age": 4 }))
        .await;
    assert_eq!(res.code(), "CSRF_INVALID");

    alice.csrf = Some(new);
    add_child(&mut alice, "Kid", 4).await;
}

#[tokio::test]
async fn protected_routes_need_a_session() {
    let app = TestApp::new();
    let mut anon = app.client();

    let res = anon.get("/api/user/profile").await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.code(), "UNAUTHORIZED");

    anon.cookie = Some("reservio_session=garbage".into());
    assert_eq!(anon.get("/api/dashboard").await.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_surface_is_hidden_and_role_gated() {
    let app = TestApp::new();
    let mut anon = app.client();
    let mut parent = app.parent("p@x.com").await;
    let mut admin = app.admin("admin@x.com").await;

    let res = anon.get("/api/admin/users").await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.body["error"], "Resource not found");

    let res = parent.get("/api/admin/users").await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.code(), "FORBIDDEN");
    let res = parent
        .post("/api/admin/slots", json!({ "date": "2099-01-01", "capacity": 3 }))
        .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.code(), "FORBIDDEN");

    // the role check comes before CSRF
    parent.csrf = None;
    let res = parent
        .post("/api/admin/slots", json!({ "date": "2099-01-01", "capacity": 3 }))
        .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.code(), "FORBIDDEN");

    // admins still need the token
    let token = admin.csrf.take();
    let res = admin
        .post("/api/admin/slots", json!({ "date": "2099-01-01", "capacity": 3 }))
        .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.code(), "CSRF_INVALID");
    admin.csrf = token;

    let res = admin.get("/api/admin/users").await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["pagination"]["total"], 2);
}

#[tokio::test]
async fn full_slot_rejects_next_reservation() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut parent = app.parent("p@x.com").await;
    let slot = create_slot(&mut admin, "2099-01-01", 1).await;
    let a = add_child(&mut parent, "A", 3).await;
    let b = add_child(&mut parent, "B", 4).await;

    let res = reserve(&mut parent, a, slot).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["reservation"]["status"], "pending");
    assert_eq!(res.body["slot_availability"]["available"], 0);
    assert_eq!(res.body["slot_availability"]["is_full"], true);

    let res = reserve(&mut parent, b, slot).await;
    assert_eq!(res.status, StatusCode::CONFLICT);
    assert_eq!(res.code(), "SLOT_FULL");
}

#[tokio::test]
async fn double_booking_is_refused_until_rejected() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut parent = app.parent("p@x.com").await;
    let slot = create_slot(&mut admin, "2099-01-01", 5).await;
    let child = add_child(&mut parent, "A", 3).await;

    let first = reserve(&mut parent, child, slot).await;
    let reservation = first.id("reservation");
    let res = reserve(&mut parent, child, slot).await;
    assert_eq!(res.status, StatusCode::CONFLICT);
    assert_eq!(res.code(), "DOUBLE_BOOKING");

    // approved still blocks
    admin.put(&format!("/api/admin/approve/{reservation}"), json!({})).await;
    assert_eq!(reserve(&mut parent, child, slot).await.code(), "DOUBLE_BOOKING");

    admin.put(&format!("/api/admin/reject/{reservation}"), json!({})).await;
    let res = reserve(&mut parent, child, slot).await;
    assert_eq!(res.status, StatusCode::OK);
}

#[tokio::test]
async fn admission_checks_run_in_order() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut alice = app.parent("alice@x.com").await;
    let mut bob = app.parent("bob@x.com").await;
    let slot = create_slot(&mut admin, "2099-01-01", 1).await;
    let alices = add_child(&mut alice, "A", 3).await;
    assert_eq!(reserve(&mut alice, alices, slot).await.status, StatusCode::OK);

    // shape before everything
    let res = reserve(&mut alice, 0, slot).await;
    assert_eq!(res.code(), "INVALID_INPUT");
    // ownership before slot existence and capacity
    assert_eq!(reserve(&mut bob, alices, 999).await.code(), "CHILD_NOT_FOUND");
    assert_eq!(reserve(&mut bob, alices, slot).await.code(), "CHILD_NOT_FOUND");
    // slot existence before capacity
    assert_eq!(reserve(&mut alice, alices, 999).await.code(), "SLOT_NOT_FOUND");
    // capacity before double booking
    assert_eq!(reserve(&mut alice, alices, slot).await.code(), "SLOT_FULL");
}

#[tokio::test]
async fn reservation_status_transitions() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut parent = app.parent("p@x.com").await;
    let slot = create_slot(&mut admin, "2099-01-01", 5).await;
    let child = add_child(&mut parent, "A", 3).await;
    let id = reserve(&mut parent, child, slot).await.id("reservation");

    let res = admin.put(&format!("/api/admin/approve/{id}"), json!({})).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["reservation"]["status"], "approved");

    let res = admin.put(&format!("/api/admin/approve/{id}"), json!({})).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_STATUS");

    // approved -> rejected is an allowed override
    let res = admin.put(&format!("/api/admin/reject/{id}"), json!({})).await;
    assert_eq!(res.body["reservation"]["status"], "rejected");

    let res = admin.put(&format!("/api/admin/approve/{id}"), json!({})).await;
    assert_eq!(res.code(), "INVALID_STATUS");
    assert_eq!(res.body["details"]["allowed_transitions"], json!([]));
}

#[tokio::test]
async fn approving_missing_reservation_is_not_found() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;

    let res = admin.put("/api/admin/approve/999", json!({})).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.code(), "RESERVATION_NOT_FOUND");

    let res = admin.put("/api/admin/reject/abc", json!({})).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_INPUT");
}

#[tokio::test]
async fn parent_cancellation_frees_the_seat() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut alice = app.parent("alice@x.com").await;
    let mut bob = app.parent("bob@x.com").await;
    let slot = create_slot(&mut admin, "2099-01-01", 1).await;
    let child = add_child(&mut alice, "A", 3).await;
    let id = reserve(&mut alice, child, slot).await.id("reservation");

    let res = bob.delete(&format!("/api/parent/reservations/{id}")).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.code(), "RESERVATION_NOT_FOUND");

    let res = alice.delete(&format!("/api/parent/reservations/{id}")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["reservation_id"], id);

    let res = alice.get(&format!("/api/slots/{slot}")).await;
    assert_eq!(res.body["availability"]["available"], 1);
    assert_eq!(alice.get("/api/parent/reservations").await.body["data"], json!([]));
}

#[tokio::test]
async fn reservation_listings_filter_and_paginate() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut alice = app.parent("alice@x.com").await;
    let mut bob = app.parent("bob@x.com").await;
    let s1 = create_slot(&mut admin, "2099-01-01", 5).await;
    let s2 = create_slot(&mut admin, "2099-01-02", 5).await;
    let a = add_child(&mut alice, "A", 3).await;
    let b = add_child(&mut bob, "B", 3).await;
    let r1 = reserve(&mut alice, a, s1).await.id("reservation");
    reserve(&mut alice, a, s2).await;
    reserve(&mut bob, b, s1).await;
    admin.put(&format!("/api/admin/approve/{r1}"), json!({})).await;

    let res = alice.get("/api/parent/reservations").await;
    assert_eq!(res.body["pagination"]["total"], 2);
    let res = alice.get("/api/parent/reservations?status=approved").await;
    assert_eq!(res.body["pagination"]["total"], 1);
    assert_eq!(res.body["data"][0]["id"], r1);

    let res = admin.get("/api/admin/reservations").await;
    assert_eq!(res.body["pagination"]["total"], 3);
    let res = admin
        .get(&format!("/api/admin/reservations?status=pending&slot_id={s1}"))
        .await;
    assert_eq!(res.body["pagination"]["total"], 1);
    let res = admin.get("/api/admin/reservations?per_page=2&page=2").await;
    assert_eq!(res.body["data"].as_array().unwrap().len(), 1);
    assert_eq!(res.body["pagination"]["total_pages"], 2);

    let res = admin.get("/api/admin/reservations?status=bogus").await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_STATUS");
    let res = admin.get("/api/admin/reservations?per_page=500").await;
    assert_eq!(res.code(), "INVALID_INPUT");
    let res = alice.get("/api/parent/reservations?page=abc").await;
    assert_eq!(res.code(), "INVALID_INPUT");
}

#[tokio::test]
async fn slot_administration() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut parent = app.parent("p@x.com").await;

    let res = admin
        .post("/api/admin/slots", json!({ "date": "2000-01-01", "capacity": 3 }))
        .await;
    assert_eq!(res.code(), "INVALID_DATE");
    let res = admin
        .post("/api/admin/slots", json!({ "date": "2099-13-01", "capacity": 3 }))
        .await;
    assert_eq!(res.code(), "INVALID_DATE");
    let res = admin
        .post("/api/admin/slots", json!({ "date": "2099-01-01", "capacity": 0 }))
        .await;
    assert_eq!(res.code(), "INVALID_CAPACITY");

    let slot = create_slot(&mut admin, "2099-01-01", 2).await;
    let a = add_child(&mut parent, "A", 3).await;
    let b = add_child(&mut parent, "B", 3).await;
    reserve(&mut parent, a, slot).await;
    reserve(&mut parent, b, slot).await;

    let uri = format!("/api/admin/slots/{slot}");
    let res = admin.put(&uri, json!({ "capacity": 1 })).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_CAPACITY");
    let res = admin.put(&uri, json!({ "capacity": 101 })).await;
    assert_eq!(res.code(), "INVALID_CAPACITY");
    let res = admin.put(&uri, json!({ "capacity": 3 })).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["slot"]["capacity"], 3);

    let res = admin.delete(&uri).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(parent.get("/api/parent/reservations").await.body["data"], json!([]));
    assert_eq!(admin.delete(&uri).await.code(), "SLOT_NOT_FOUND");
}

#[tokio::test]
async fn public_slot_views() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut parent = app.parent("p@x.com").await;
    let mut anon = app.client();
    let late = create_slot(&mut admin, "2099-02-01", 2).await;
    let early = create_slot(&mut admin, "2099-01-01", 1).await;
    let also_early = create_slot(&mut admin, "2099-01-01", 4).await;
    let child = add_child(&mut parent, "A", 3).await;
    reserve(&mut parent, child, early).await;

    let res = anon.get("/api/slots").await;
    assert_eq!(res.status, StatusCode::OK);
    let ids: Vec<u64> = res.body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![early, also_early, late]);
    assert_eq!(res.body["data"][0]["is_full"], true);
    assert_eq!(res.body["data"][0]["booked"], 1);

    let res = anon.get("/api/slots/calendar").await;
    let day = res.body["calendar"]["2099-01-01"].as_array().unwrap();
    assert_eq!(day.len(), 2);
    assert_eq!(day[0]["remaining"], 0);
    assert_eq!(day[1]["remaining"], 4);

    let res = anon.get(&format!("/api/slots/{late}")).await;
    assert_eq!(res.body["slot"]["date"], "2099-02-01");
    assert_eq!(res.body["availability"]["available"], 2);
    assert_eq!(anon.get("/api/slots/999").await.code(), "SLOT_NOT_FOUND");
    assert_eq!(anon.get("/api/slots/0").await.code(), "INVALID_INPUT");
}

#[tokio::test]
async fn session_version_bump_kills_sessions() {
    let app = TestApp::new();
    let mut alice = app.parent("alice@x.com").await;
    let alice_id = app.user_id("alice@x.com");

    app.state.storage.bump_session_version(alice_id).unwrap();
    let res = alice.get("/api/user/profile").await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"], "Session expired, please log in again");
    assert!(alice.cookie.is_none());

    let mut fresh = app.login("alice@x.com", PASSWORD).await;
    assert_eq!(fresh.get("/api/user/profile").await.status, StatusCode::OK);
}

#[tokio::test]
async fn logout_and_logout_all() {
    let app = TestApp::new();
    let mut first = app.parent("alice@x.com").await;
    let mut second = app.login("alice@x.com", PASSWORD).await;
    let mut third = app.login("alice@x.com", PASSWORD).await;

    let res = first.post("/api/auth/logout", json!({})).await;
    assert_eq!(res.status, StatusCode::OK);
    assert!(first.cookie.is_none());
    assert_eq!(second.get("/api/user/profile").await.status, StatusCode::OK);

    let res = second.post("/api/user/logout-all", json!({})).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(second.get("/api/user/profile").await.status, StatusCode::UNAUTHORIZED);
    assert_eq!(third.get("/api/user/profile").await.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn lockout_after_five_failures() {
    let app = TestApp::new();
    app.parent("alice@x.com").await;
    let mut anon = app.client();
    let wrong = json!({ "email": "alice@x.com", "password": "wrongpass1" });

    for _ in 0..5 {
        let res = anon.post("/api/auth/login", wrong.clone()).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
        assert_eq!(res.body["error"], "Invalid credentials");
    }

    // locked even with the right password
    let res = anon
        .post("/api/auth/login", json!({ "email": "alice@x.com", "password": PASSWORD }))
        .await;
    assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.code(), "RATE_LIMIT_EXCEEDED");
    assert!(res.body["details"]["retry_after"].as_i64().unwrap() > 0);
    assert!(res.headers.contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn successful_login_resets_failure_count() {
    let app = TestApp::new();
    app.parent("alice@x.com").await;
    let mut anon = app.client();
    let wrong = json!({ "email": "alice@x.com", "password": "wrongpass1" });

    for _ in 0..4 {
        anon.post("/api/auth/login", wrong.clone()).await;
    }
    app.login("alice@x.com", PASSWORD).await;
    for _ in 0..4 {
        let res = anon.post("/api/auth/login", wrong.clone()).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    }
    app.login("alice@x.com", PASSWORD).await;

    // unknown emails count too
    let res = anon
        .post("/api/auth/login", json!({ "email": "ghost@x.com", "password": PASSWORD }))
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn password_reset_round_trip() {
    let app = TestApp::new();
    let mut alice = app.parent("alice@x.com").await;
    let mut anon = app.client();

    let res = anon
        .post("/api/auth/request-reset", json!({ "email": "ghost@x.com" }))
        .await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);

    let res = anon
        .post("/api/auth/request-reset", json!({ "email": "alice@x.com" }))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    let token = app.mailer.last_token_for("alice@x.com").unwrap();
    assert_eq!(token.len(), 43);
    assert!(app.mailer.sent()[0].body.contains("http://localhost:3000/reset-password?token="));

    // a weak password does not burn the token
    let res = anon
        .post("/api/auth/reset-password", json!({ "token": token, "password": "short" }))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_INPUT");

    let res = anon
        .post("/api/auth/reset-password", json!({ "token": token, "password": "newpassword1" }))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["message"], "Password reset successful");

    assert_eq!(alice.get("/api/user/profile").await.status, StatusCode::UNAUTHORIZED);
    let res = anon
        .post("/api/auth/login", json!({ "email": "alice@x.com", "password": PASSWORD }))
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    app.login("alice@x.com", "newpassword1").await;

    let res = anon
        .post("/api/auth/reset-password", json!({ "token": token, "password": "another12" }))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.code(), "INVALID_TOKEN");
    assert!(res.body.get("details").is_none(), "{}", res.body);
}

#[tokio::test]
async fn profile_updates() {
    let app = TestApp::new();
    app.parent("bob@x.com").await;
    let mut alice = app.parent("alice@x.com").await;
    let mut other_device = app.login("alice@x.com", PASSWORD).await;

    let res = alice
        .put("/api/user/profile", json!({ "first_name": "Alice", "phone": "555-0100" }))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["user"]["first_name"], "Alice");

    let res = alice.put("/api/user/profile", json!({ "email": "bob@x.com" })).await;
    assert_eq!(res.status, StatusCode::CONFLICT);
    assert_eq!(res.code(), "DUPLICATE_EMAIL");
    let res = alice.put("/api/user/profile", json!({ "email": "nope" })).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    // password change re-issues this session and ends the others
    let res = alice
        .put("/api/user/profile", json!({ "password": "newpassword1" }))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(alice.get("/api/user/profile").await.status, StatusCode::OK);
    assert_eq!(other_device.get("/api/user/profile").await.status, StatusCode::UNAUTHORIZED);
    app.login("alice@x.com", "newpassword1").await;
}

#[tokio::test]
async fn admin_user_management() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut parent = app.parent("p@x.com").await;
    let admin_id = app.user_id("admin@x.com");
    let parent_id = app.user_id("p@x.com");

    let res = admin.delete(&format!("/api/admin/users/{admin_id}")).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(admin.delete("/api/admin/users/999").await.status, StatusCode::NOT_FOUND);

    let res = admin
        .put(&format!("/api/admin/users/{parent_id}/role"), json!({ "role": "superuser" }))
        .await;
    assert_eq!(res.code(), "INVALID_ROLE");
    let res = admin
        .put(&format!("/api/admin/users/{parent_id}/role"), json!({ "role": "admin" }))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["user"]["role"], "admin");
    // the role is read per request, no re-login needed
    assert_eq!(parent.get("/api/admin/users").await.status, StatusCode::OK);

    let res = admin.delete(&format!("/api/admin/users/{parent_id}")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["user_id"], parent_id);
    assert_eq!(parent.get("/api/user/profile").await.status, StatusCode::UNAUTHORIZED);
    let res = app
        .client()
        .post("/api/auth/login", json!({ "email": "p@x.com", "password": PASSWORD }))
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    // the email is free again
    app.parent("p@x.com").await;
    let res = admin.get("/api/admin/users").await;
    assert_eq!(res.body["pagination"]["total"], 2);
}

#[tokio::test]
async fn announcements_lifecycle() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut anon = app.client();

    let res = admin
        .post("/api/admin/announcements", json!({ "title": "", "content": "x" }))
        .await;
    assert_eq!(res.code(), "INVALID_INPUT");
    let res = admin
        .post("/api/admin/announcements", json!({ "title": "t".repeat(201), "content": "x" }))
        .await;
    assert_eq!(res.code(), "INVALID_INPUT");

    let first = admin
        .post("/api/admin/announcements", json!({ "title": "Opening", "content": "Hello" }))
        .await
        .id("announcement");
    let second = admin
        .post("/api/admin/announcements", json!({ "title": "Closure", "content": "Holiday" }))
        .await
        .id("announcement");

    let res = anon.get("/api/announcements").await;
    assert_eq!(res.body["data"][0]["id"], second);
    assert_eq!(res.body["data"][1]["id"], first);
    assert_eq!(res.body["data"][0]["author"]["email"], "admin@x.com");

    let uri = format!("/api/admin/announcements/{first}");
    let res = admin
        .put(&uri, json!({ "title": "Grand opening", "content": "Hello all" }))
        .await;
    assert_eq!(res.body["announcement"]["title"], "Grand opening");

    let res = admin.delete(&uri).await;
    assert_eq!(res.body["announcement_id"], first);
    assert_eq!(admin.delete(&uri).await.status, StatusCode::NOT_FOUND);
    assert_eq!(anon.get("/api/announcements").await.body["pagination"]["total"], 1);
}

#[tokio::test]
async fn dashboard_scopes_by_role() {
    let app = TestApp::new();
    let mut admin = app.admin("admin@x.com").await;
    let mut alice = app.parent("alice@x.com").await;
    let mut bob = app.parent("bob@x.com").await;
    let full = create_slot(&mut admin, "2099-01-01", 1).await;
    create_slot(&mut admin, "2099-01-02", 5).await;
    let a = add_child(&mut alice, "A", 3).await;
    add_child(&mut bob, "B1", 3).await;
    add_child(&mut bob, "B2", 3).await;
    reserve(&mut alice, a, full).await;

    let res = alice.get("/api/dashboard").await;
    assert_eq!(
        res.body,
        json!({ "total_children": 1, "total_reservations": 1, "open_slots": 1 })
    );
    let res = bob.get("/api/dashboard").await;
    assert_eq!(
        res.body,
        json!({ "total_children": 2, "total_reservations": 0, "open_slots": 1 })
    );
    let res = admin.get("/api/dashboard").await;
    assert_eq!(
        res.body,
        json!({ "total_children": 3, "total_reservations": 1, "open_slots": 1 })
    );
}

#[tokio::test]
async fn requests_are_throttled_per_client_ip() {
    let app = TestApp::with_config(Config {
        test_mode: false,
        rate_limit_per_sec: 1,
        rate_limit_burst: 3,
        ..Config::for_tests()
    });
    let mut client = app.client();

    for _ in 0..3 {
        assert_eq!(client.get("/health").await.status, StatusCode::OK);
    }
    let res = client.get("/api/slots").await;
    assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.code(), "RATE_LIMIT_EXCEEDED");
    assert_eq!(res.body["error"], "Rate limit exceeded. Please try again later.");
    assert!(res.headers.contains_key(header::RETRY_AFTER));
    assert_eq!(res.headers["x-content-type-options"], "nosniff");

    let other = Request::builder()
        .uri("/health")
        .header("x-forwarded-for", "203.0.113.7, 10.0.0.1");
    assert_eq!(client.dispatch(other, Body::empty()).await.status, StatusCode::OK);
}

#[tokio::test]
async fn test_mode_skips_the_request_throttle() {
    let app = TestApp::new();
    let mut client = app.client();
    for _ in 0..40 {
        assert_eq!(client.get("/health").await.status, StatusCode::OK);
    }
}
