// src/webhook.rs
//! Billing webhook verification and dispatch.
//!
//! The signature header has the form `t=<unix seconds>,v1=<hex hmac>[,v1=...]`;
//! the HMAC-SHA256 is taken over `"{t}.{raw body}"` with the signing secret.
use crate::billing::RemoteSubscription;
use crate::error::{AppError, AppResult};
use crate::store::WebhookEventStore;
use crate::subscriptions::{SubscriptionController, SyncOutcome};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }

    /// Hex signature for `payload` at `timestamp`.
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> String {
        hex::encode(self.mac(timestamp, payload).finalize().into_bytes())
    }

    pub fn verify(&self, payload: &[u8], header: &str, now: DateTime<Utc>) -> AppResult<()> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let Some(timestamp) = timestamp else {
            tracing::debug!("Webhook signature header has no timestamp");
            return Err(AppError::InvalidSignature);
        };
        // the header is unauthenticated here; abs_diff cannot overflow on extreme values
        if now.timestamp().abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            tracing::warn!(timestamp, "Webhook timestamp outside tolerance");
            return Err(AppError::InvalidSignature);
        }

        let expected = self.mac(timestamp, payload).finalize().into_bytes();
        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| bool::from(expected.as_slice().ct_eq(&provided)))
                .unwrap_or(false)
        });
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(AppError::InvalidSignature);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

impl WebhookEvent {
    fn created_at(&self) -> AppResult<DateTime<Utc>> {
        Utc.timestamp_opt(self.created, 0)
            .single()
            .ok_or_else(|| AppError::validation("Webhook event has an invalid created timestamp"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    Ignored,
    AlreadyProcessed,
}

pub struct WebhookProcessor {
    verifier: SignatureVerifier,
    events: Arc<dyn WebhookEventStore>,
    subscriptions: Arc<SubscriptionController>,
}

impl WebhookProcessor {
    pub fn new(
        verifier: SignatureVerifier,
        events: Arc<dyn WebhookEventStore>,
        subscriptions: Arc<SubscriptionController>,
    ) -> Self {
        Self {
            verifier,
            events,
            subscriptions,
        }
    }

    /// Verifies and parses a raw delivery. Nothing is processed on failure.
    pub fn parse(&self, payload: &[u8], signature: Option<&str>) -> AppResult<WebhookEvent> {
        let signature = signature.ok_or(AppError::InvalidSignature)?;
        self.verifier.verify(payload, signature, Utc::now())?;
        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(error = %e, "Malformed webhook payload");
            AppError::validation("Malformed webhook payload")
        })
    }

    /// Applies an event once. The event id is recorded only after success,
    /// so a failed delivery can be retried by the billing system.
    pub async fn handle(&self, event: &WebhookEvent) -> AppResult<WebhookOutcome> {
        if self.events.is_event_processed(&event.id).await? {
            tracing::debug!(event_id = %event.id, "Webhook event already processed");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let created = event.created_at()?;
        let outcome = match event.event_type.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                let remote = RemoteSubscription::from_json(&event.data.object)?;
                self.subscriptions.sync_remote(&remote, created).await?;
                WebhookOutcome::Processed
            }
            "customer.subscription.deleted" => {
                let remote = RemoteSubscription::from_json(&event.data.object)?;
                self.subscriptions
                    .mark_remote_deleted(&remote.id, remote.canceled_at, created)
                    .await?;
                WebhookOutcome::Processed
            }
            "checkout.session.completed" => {
                match event.data.object.get("subscription").and_then(Value::as_str) {
                    Some(remote_id) => {
                        let synced = self
                            .subscriptions
                            .refresh_from_remote(remote_id, created)
                            .await?;
                        if synced == SyncOutcome::Skipped {
                            tracing::info!(remote_id, "Checkout completed before subscription became active");
                        }
                        WebhookOutcome::Processed
                    }
                    None => WebhookOutcome::Ignored,
                }
            }
            other => {
                tracing::debug!(event_type = other, "Ignoring webhook event");
                WebhookOutcome::Ignored
            }
        };

        if outcome == WebhookOutcome::Processed {
            self.events.mark_event_processed(&event.id).await?;
        }
        tracing::info!(event_id = %event.id, event_type = %event.event_type, ?outcome, "Webhook handled");
        Ok(outcome)
    }
}
