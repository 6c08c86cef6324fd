// src/tokens.rs
//! Password reset / creation through single-use verification tokens.
use crate::error::{AppError, AppResult};
use crate::mailer::{Email, Mailer};
use crate::models::VerificationToken;
use crate::store::{TokenStore, UserStore};
use bcrypt::{DEFAULT_COST, hash};
use chrono::{Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::sync::Arc;

const TOKEN_LEN: usize = 32;
pub const MIN_PASSWORD_LEN: usize = 8;

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub struct PasswordResets {
    users: Arc<dyn UserStore>,
    tokens: Arc<dyn TokenStore>,
    mailer: Arc<dyn Mailer>,
    app_base_url: String,
    ttl: Duration,
    bcrypt_cost: u32,
}

impl PasswordResets {
    pub fn new(
        users: Arc<dyn UserStore>,
        tokens: Arc<dyn TokenStore>,
        mailer: Arc<dyn Mailer>,
        app_base_url: impl Into<String>,
    ) -> Self {
        Self {
            users,
            tokens,
            mailer,
            app_base_url: app_base_url.into(),
            ttl: Duration::hours(1),
            bcrypt_cost: DEFAULT_COST,
        }
    }

    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    /// Issues a token and mails the reset link. Unknown addresses succeed
    /// silently so the endpoint does not reveal which emails are registered.
    pub async fn request_reset(&self, email: &str) -> AppResult<()> {
        let identifier = normalize_email(email);

        match self.tokens.delete_expired_tokens(Utc::now()).await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Purged expired verification tokens"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge expired verification tokens"),
        }

        if self.users.user_by_email(&identifier).await?.is_none() {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(());
        }

        let token = VerificationToken {
            identifier: identifier.clone(),
            token: random_token(),
            expires_at: Utc::now() + self.ttl,
        };
        self.tokens.save_token(&token).await?;

        let email = Email {
            to: identifier.clone(),
            subject: "Reset your password".to_string(),
            body: format!(
                "Use this link to set a new password. It expires in one hour.\n\n{}/reset-password?token={}&email={}",
                self.app_base_url, token.token, identifier
            ),
        };
        // the token is stored; a failed send only means the user asks again
        if let Err(e) = self.mailer.send(&email).await {
            tracing::error!(error = %e, "Failed to send password reset email");
        }
        Ok(())
    }

    pub async fn reset_password(&self, email: &str, token: &str, new_password: &str) -> AppResult<()> {
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(AppError::validation(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let identifier = normalize_email(email);
        let invalid = || AppError::validation("Invalid or expired token");

        let stored = self
            .tokens
            .take_token(&identifier, token)
            .await?
            .ok_or_else(invalid)?;
        if stored.expires_at <= Utc::now() {
            return Err(invalid());
        }

        let user = self
            .users
            .user_by_email(&identifier)
            .await?
            .ok_or_else(invalid)?;
        let password_hash = hash(new_password, self.bcrypt_cost)
            .map_err(|e| AppError::internal(format!("Password hashing error: {e}")))?;
        self.users.update_password(user.id, &password_hash).await?;
        tracing::info!(user_id = %user.id, "Password reset");
        Ok(())
    }
}
