//! Runtime configuration loaded from environment variables.
//!
//! `main` calls `dotenvy::dotenv()` first, so a local `.env` file works too.

use std::env;
use std::path::PathBuf;
use thiserror::Error;

use crate::rate_limit::{REQUESTS_PER_SECOND, REQUEST_BURST};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("SESSION_SECRET must be set (or run with TEST_MODE=1)")]
    MissingSessionSecret,
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// SMTP relay settings. Absent host means mail is only logged.
#[derive(Debug, Clone, PartialEq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Relaxes secrets and cookie flags for local runs and tests.
    pub test_mode: bool,
    pub session_secret: String,
    pub session_ttl_secs: u64,
    pub cookie_secure: bool,
    pub bcrypt_cost: u32,
    /// Base for links in outgoing mail, e.g. the reset-password page.
    pub app_base_url: String,
    pub smtp: Option<SmtpConfig>,
    pub allowed_origins: Vec<String>,
    pub enable_hsts: bool,
    pub csp: String,
    /// Per-IP request budget. Not enforced in test mode.
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
}

pub const DEFAULT_CSP: &str = "default-src 'self'; frame-ancestors 'none'; base-uri 'self'";
const TEST_SESSION_SECRET: &str = "reservio-test-secret";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let test_mode = get("TEST_MODE").map(|v| is_truthy(&v)).unwrap_or(false);

        let session_secret = match get("SESSION_SECRET") {
            Some(secret) => secret,
            None if test_mode => TEST_SESSION_SECRET.to_string(),
            None => return Err(ConfigError::MissingSessionSecret),
        };

        let smtp = match get("SMTP_HOST") {
            Some(host) => Some(SmtpConfig {
                host,
                port: parse_or(get("SMTP_PORT"), "SMTP_PORT", 587)?,
                username: get("SMTP_USER"),
                password: get("SMTP_PASSWORD"),
                from: get("SMTP_FROM").unwrap_or_else(|| "noreply@localhost".to_string()),
            }),
            None => None,
        };

        let allowed_origins: Vec<String> = get("ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        // credentialed CORS cannot use a wildcard origin
        if let Some(origin) = allowed_origins.iter().find(|o| o.as_str() == "*") {
            return Err(ConfigError::Invalid {
                key: "ALLOWED_ORIGINS",
                value: origin.clone(),
            });
        }

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(get("PORT"), "PORT", 8080)?,
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "reservio_data".to_string())),
            test_mode,
            session_secret,
            session_ttl_secs: parse_or(get("SESSION_TTL_SECS"), "SESSION_TTL_SECS", 3600)?,
            cookie_secure: match get("COOKIE_SECURE") {
                Some(v) => is_truthy(&v),
                None => !test_mode,
            },
            bcrypt_cost: parse_or(get("BCRYPT_COST"), "BCRYPT_COST", bcrypt::DEFAULT_COST)?,
            app_base_url: get("APP_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            smtp,
            allowed_origins,
            enable_hsts: get("ENABLE_HSTS").map(|v| is_truthy(&v)).unwrap_or(false),
            csp: get("CSP").unwrap_or_else(|| DEFAULT_CSP.to_string()),
            rate_limit_per_sec: parse_or(get("RATE_LIMIT_RPS"), "RATE_LIMIT_RPS", REQUESTS_PER_SECOND)?,
            rate_limit_burst: parse_or(get("RATE_LIMIT_BURST"), "RATE_LIMIT_BURST", REQUEST_BURST)?,
        })
    }

    /// Settings for in-process tests: fast hashing, no `Secure` cookie.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            data_dir: PathBuf::from("unused"),
            test_mode: true,
            session_secret: TEST_SESSION_SECRET.to_string(),
            session_ttl_secs: 3600,
            cookie_secure: false,
            bcrypt_cost: 4,
            app_base_url: "http://localhost:3000".to_string(),
            smtp: None,
            allowed_origins: Vec::new(),
            enable_hsts: false,
            csp: DEFAULT_CSP.to_string(),
            rate_limit_per_sec: REQUESTS_PER_SECOND,
            rate_limit_burst: REQUEST_BURST,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
