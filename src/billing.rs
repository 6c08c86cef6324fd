// src/billing.rs
//! Remote billing system client.
//!
//! [`BillingClient`] is the seam the subscription controller talks to;
//! [`StripeClient`] implements it over the Stripe REST API with reqwest.
//! Every mutating call carries an `Idempotency-Key` so a retried request
//! cannot apply twice on the remote side.
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::SubscriptionStatus;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Mapping between local plan ids and billing price ids.
#[derive(Clone, Debug)]
pub struct Plans {
    plans: Vec<(String, String)>,
}

impl Plans {
    pub fn new<I, A, B>(plans: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self {
            plans: plans
                .into_iter()
                .map(|(plan, price)| (plan.into(), price.into()))
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new([
            ("basic", config.stripe_price_basic.clone()),
            ("premium", config.stripe_price_premium.clone()),
        ])
    }

    pub fn price_for(&self, plan_id: &str) -> Option<&str> {
        self.plans
            .iter()
            .find(|(plan, _)| plan == plan_id)
            .map(|(_, price)| price.as_str())
    }

    pub fn plan_for_price(&self, price_id: &str) -> Option<&str> {
        self.plans
            .iter()
            .find(|(_, price)| price == price_id)
            .map(|(plan, _)| plan.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub customer_email: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// The fields of a billing-side subscription object this service cares about.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteSubscription {
    pub id: String,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub price_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Set from `metadata.user_id` when the checkout was started by us.
    pub user_id: Option<Uuid>,
}

fn unix_field(obj: &Value, key: &str) -> Option<DateTime<Utc>> {
    obj.get(key)
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

impl RemoteSubscription {
    pub fn from_json(obj: &Value) -> AppResult<Self> {
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::validation("Missing subscription id"))?
            .to_string();

        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::validation("Missing subscription status"))?
            .to_string();

        let first_item = obj
            .get("items")
            .and_then(|items| items.get("data"))
            .and_then(Value::as_array)
            .and_then(|items| items.first());

        let price_id = first_item
            .and_then(|item| item.get("price"))
            .and_then(|price| price.get("id"))
            .and_then(Value::as_str)
            .map(String::from);

        // newer API versions report the period on the item instead of the subscription
        let current_period_start = unix_field(obj, "current_period_start")
            .or_else(|| first_item.and_then(|item| unix_field(item, "current_period_start")));
        let current_period_end = unix_field(obj, "current_period_end")
            .or_else(|| first_item.and_then(|item| unix_field(item, "current_period_end")));

        let user_id = obj
            .get("metadata")
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok());

        Ok(Self {
            id,
            status,
            cancel_at_period_end: obj
                .get("cancel_at_period_end")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            price_id,
            current_period_start,
            current_period_end,
            canceled_at: unix_field(obj, "canceled_at"),
            user_id,
        })
    }

    /// Local status for the remote one. `None` means the subscription is not
    /// usable yet (payment still incomplete) and must not be materialized.
    pub fn local_status(&self) -> Option<SubscriptionStatus> {
        match self.status.as_str() {
            "active" | "trialing" | "past_due" => Some(SubscriptionStatus::Active),
            "canceled" => Some(SubscriptionStatus::Cancelled),
            "unpaid" | "incomplete_expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }
}

#[async_trait]
pub trait BillingClient: Send + Sync {
    async fn create_checkout_session(&self, request: &CheckoutRequest)
    -> AppResult<CheckoutSession>;

    async fn get_subscription(&self, remote_id: &str) -> AppResult<RemoteSubscription>;

    async fn set_cancel_at_period_end(
        &self,
        remote_id: &str,
        cancel: bool,
        idempotency_key: &str,
    ) -> AppResult<()>;

    async fn cancel_immediately(&self, remote_id: &str, idempotency_key: &str) -> AppResult<()>;

    async fn change_price(
        &self,
        remote_id: &str,
        price_id: &str,
        idempotency_key: &str,
    ) -> AppResult<()>;
}

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    api_url: String,
    secret_key: String,
}

#[derive(Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

impl StripeClient {
    pub fn new(api_url: impl Into<String>, secret_key: impl Into<String>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        Self::new(&config.stripe_api_url, &config.stripe_secret_key)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_url, path)
    }

    async fn send(&self, operation: &str, request: reqwest::RequestBuilder) -> AppResult<Value> {
        let response = request.bearer_auth(&self.secret_key).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Value>().await?);
        }

        let message = response
            .json::<StripeErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error.message)
            .unwrap_or_else(|| "no error message".to_string());
        tracing::error!(operation, %status, error_message = %message, "Billing API call failed");
        Err(AppError::Billing(format!("{operation}: {status} {message}")))
    }

    async fn fetch_subscription(&self, remote_id: &str) -> AppResult<Value> {
        let path = format!("subscriptions/{remote_id}");
        self.send("get_subscription", self.http.get(self.url(&path)))
            .await
    }
}

#[async_trait]
impl BillingClient for StripeClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> AppResult<CheckoutSession> {
        let user_id = request.user_id.to_string();
        let params = [
            ("mode", "subscription"),
            ("line_items[0][price]", request.price_id.as_str()),
            ("line_items[0][quantity]", "1"),
            ("success_url", request.success_url.as_str()),
            ("cancel_url", request.cancel_url.as_str()),
            ("customer_email", request.customer_email.as_str()),
            ("client_reference_id", user_id.as_str()),
            ("metadata[user_id]", user_id.as_str()),
            ("subscription_data[metadata][user_id]", user_id.as_str()),
        ];
        let body = self
            .send(
                "create_checkout_session",
                self.http.post(self.url("checkout/sessions")).form(&params),
            )
            .await?;
        serde_json::from_value(body)
            .map_err(|e| AppError::Billing(format!("create_checkout_session: {e}")))
    }

    async fn get_subscription(&self, remote_id: &str) -> AppResult<RemoteSubscription> {
        let body = self.fetch_subscription(remote_id).await?;
        RemoteSubscription::from_json(&body)
    }

    async fn set_cancel_at_period_end(
        &self,
        remote_id: &str,
        cancel: bool,
        idempotency_key: &str,
    ) -> AppResult<()> {
        let path = format!("subscriptions/{remote_id}");
        let params = [("cancel_at_period_end", if cancel { "true" } else { "false" })];
        self.send(
            "set_cancel_at_period_end",
            self.http
                .post(self.url(&path))
                .header("Idempotency-Key", idempotency_key)
                .form(&params),
        )
        .await?;
        Ok(())
    }

    async fn cancel_immediately(&self, remote_id: &str, idempotency_key: &str) -> AppResult<()> {
        let path = format!("subscriptions/{remote_id}");
        self.send(
            "cancel_immediately",
            self.http
                .delete(self.url(&path))
                .header("Idempotency-Key", idempotency_key),
        )
        .await?;
        Ok(())
    }

    async fn change_price(
        &self,
        remote_id: &str,
        price_id: &str,
        idempotency_key: &str,
    ) -> AppResult<()> {
        let current = self.fetch_subscription(remote_id).await?;
        let item_id = current
            .get("items")
            .and_then(|items| items.get("data"))
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Billing("change_price: subscription has no items".into()))?
            .to_string();

        let path = format!("subscriptions/{remote_id}");
        let params = [
            ("items[0][id]", item_id.as_str()),
            ("items[0][price]", price_id),
            ("proration_behavior", "create_prorations"),
        ];
        self.send(
            "change_price",
            self.http
                .post(self.url(&path))
                .header("Idempotency-Key", idempotency_key)
                .form(&params),
        )
        .await?;
        Ok(())
    }
}
