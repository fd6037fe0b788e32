//! Outgoing mail for password resets.
//!
//! Handlers depend on the [`Mailer`] trait only. Production wires
//! [`SmtpMailer`]; without SMTP settings [`LogMailer`] writes the link to the
//! log, and tests capture messages in [`MemoryMailer`].

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::config::SmtpConfig;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address {0}")]
    Address(String),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("smtp transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_password_reset(&self, to: &str, reset_link: &str) -> Result<(), MailError>;
}

const RESET_SUBJECT: &str = "Reset your password";

fn reset_body(reset_link: &str) -> String {
    format!(
        "A password reset was requested for your account.\n\n\
         Open the link below to choose a new password. It expires in 30 minutes.\n\n\
         {reset_link}\n\n\
         If you did not request this, ignore this message."
    )
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    attempts: u32,
    retry_pause: Duration,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| MailError::Transport(e.to_string()))?
            .port(config.port);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            from: config.from.clone(),
            attempts: 3,
            retry_pause: Duration::from_secs(2),
        })
    }

    fn build_message(&self, to: &str, reset_link: &str) -> Result<Message, MailError> {
        Message::builder()
            .from(
                self.from
                    .parse()
                    .map_err(|_| MailError::Address(self.from.clone()))?,
            )
            .to(to.parse().map_err(|_| MailError::Address(to.to_string()))?)
            .subject(RESET_SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(reset_body(reset_link))
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_password_reset(&self, to: &str, reset_link: &str) -> Result<(), MailError> {
        let message = self.build_message(to, reset_link)?;
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.transport.send(message.clone()).await {
                Ok(_) => {
                    tracing::info!(to, attempt, "password reset mail sent");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(to, attempt, error = %e, "password reset mail failed");
                    last_error = Some(e.to_string());
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_pause).await;
                    }
                }
            }
        }
        Err(MailError::Transport(
            last_error.unwrap_or_else(|| "no attempts made".to_string()),
        ))
    }
}

/// Development mailer: logs the link instead of sending it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_password_reset(&self, to: &str, reset_link: &str) -> Result<(), MailError> {
        tracing::info!(to, reset_link, "SMTP not configured, password reset link logged");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Keeps every message in memory so tests can read the reset link back.
#[derive(Default)]
pub struct MemoryMailer {
    outbox: Mutex<Vec<SentMail>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.outbox.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Reset token from the most recent mail to `to`.
    pub fn last_token_for(&self, to: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.to == to)
            .and_then(|m| {
                m.body
                    .split_once("token=")
                    .map(|(_, rest)| rest.split_whitespace().next().unwrap_or("").to_string())
            })
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send_password_reset(&self, to: &str, reset_link: &str) -> Result<(), MailError> {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.push(SentMail {
                to: to.to_string(),
                subject: RESET_SUBJECT.to_string(),
                body: reset_body(reset_link),
            });
        }
        Ok(())
    }
}
