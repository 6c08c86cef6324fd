// src/mailer.rs
use crate::error::AppResult;
use async_trait::async_trait;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> AppResult<()>;
}

/// Writes outgoing mail to the log instead of delivering it.
///
/// Bodies carry single-use links, so they are only logged at debug level.
#[derive(Clone, Debug)]
pub struct LogMailer {
    from: String,
}

impl LogMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> AppResult<()> {
        tracing::info!(from = %self.from, to = %email.to, subject = %email.subject, "Sending email");
        tracing::debug!(body = %email.body, "Email body");
        Ok(())
    }
}
