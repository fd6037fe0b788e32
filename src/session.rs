//! Cookie sessions backed by the `sessions` tree.
//!
//! The browser holds a signed token naming a [`SessionRecord`]; the record
//! holds the user id, the session-version snapshot and the CSRF token. A
//! record whose snapshot no longer matches the user's `session_version` is
//! dead even though the cookie still verifies.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::auth::{create_session_token, random_token, validate_session_token};
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::models::{SessionRecord, User};
use crate::storage::Storage;

pub const SESSION_COOKIE: &str = "reservio_session";
pub const CSRF_HEADER: HeaderName = HeaderName::from_static("x-csrf-token");
pub const CSRF_FORM_FIELD: &str = "csrf_token";
pub const CSRF_TTL_SECS: i64 = 2 * 60 * 60;

#[derive(Clone)]
pub struct SessionManager {
    secret: Vec<u8>,
    ttl_secs: u64,
    cookie_secure: bool,
}

/// A freshly started session and the cookie that points at it.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub record: SessionRecord,
    pub cookie: String,
}

impl IssuedSession {
    /// `Set-Cookie` plus the CSRF header for the response that started it.
    pub fn headers(&self) -> ApiResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(header::SET_COOKIE, header_value(&self.cookie)?);
        headers.insert(CSRF_HEADER, header_value(&self.record.csrf_token)?);
        Ok(headers)
    }
}

pub fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| {
        tracing::error!(error = %e, "unencodable header value");
        ApiError::internal("An internal error occurred")
    })
}

impl SessionManager {
    pub fn new(config: &Config) -> Self {
        Self {
            secret: config.session_secret.as_bytes().to_vec(),
            ttl_secs: config.session_ttl_secs,
            cookie_secure: config.cookie_secure,
        }
    }

    /// Persist a new session for `user` and sign a cookie for it.
    pub fn start(&self, storage: &Storage, user: &User) -> ApiResult<IssuedSession> {
        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user.id,
            session_version: user.session_version,
            csrf_token: random_token(),
            csrf_expires_at: now + Duration::seconds(CSRF_TTL_SECS),
            created_at: now,
            expires_at: now + Duration::seconds(self.ttl_secs as i64),
        };
        let purged = storage.purge_expired_sessions(now)?;
        if purged > 0 {
            tracing::debug!(purged, "expired sessions removed");
        }
        storage.put_session(&record)?;

        let token = create_session_token(&record.id, user.id, self.ttl_secs, &self.secret)
            .map_err(|e| {
                tracing::error!(error = %e, "failed to sign session cookie");
                ApiError::internal("An internal error occurred")
            })?;
        tracing::debug!(user_id = user.id, session = %record.id, "session started");
        Ok(IssuedSession {
            cookie: self.cookie(&token),
            record,
        })
    }

    /// The live session named by the request cookie, if any. Unsigned,
    /// unknown and expired sessions all read as `None`.
    pub fn load(&self, storage: &Storage, headers: &HeaderMap) -> ApiResult<Option<SessionRecord>> {
        let Some(token) = cookie_value(headers, SESSION_COOKIE) else {
            return Ok(None);
        };
        let claims = match validate_session_token(&token, &self.secret) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "rejected session cookie");
                return Ok(None);
            }
        };
        let Some(record) = storage.get_session(&claims.sid)? else {
            return Ok(None);
        };
        if record.user_id != claims.sub {
            return Ok(None);
        }
        if Utc::now() >= record.expires_at {
            storage.delete_session(&record.id)?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Issue a CSRF token when the session has none or it expired.
    /// Returns true when a new token was written.
    pub fn ensure_csrf(&self, storage: &Storage, record: &mut SessionRecord) -> ApiResult<bool> {
        if !record.csrf_token.is_empty() && Utc::now() < record.csrf_expires_at {
            return Ok(false);
        }
        self.rotate_csrf(storage, record)?;
        Ok(true)
    }

    pub fn rotate_csrf(&self, storage: &Storage, record: &mut SessionRecord) -> ApiResult<()> {
        record.csrf_token = random_token();
        record.csrf_expires_at = Utc::now() + Duration::seconds(CSRF_TTL_SECS);
        storage.put_session(record)?;
        Ok(())
    }

    pub fn destroy(&self, storage: &Storage, session_id: &str) -> ApiResult<()> {
        storage.delete_session(session_id)?;
        Ok(())
    }

    fn cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
            self.ttl_secs
        );
        if self.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value that removes the session cookie.
    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0");
        if self.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Value of the named cookie across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}
