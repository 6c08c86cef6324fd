// src/subscriptions.rs
//! Subscription lifecycle.
//!
//! Local rows are a cache of the billing system's truth. User and admin
//! actions call the billing system first and only touch the local row after
//! the remote call succeeded; webhooks then reconcile the row again by remote
//! subscription id, so a webhook that arrives before, after, or instead of the
//! local write converges on the same state.
use crate::billing::{BillingClient, CheckoutRequest, CheckoutSession, Plans, RemoteSubscription};
use crate::error::{AppError, AppResult};
use crate::models::{Subscription, SubscriptionState, SubscriptionStatus, User};
use crate::store::SubscriptionStore;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Postgres keeps microseconds; rounding up front keeps compare-and-set exact.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Key for a mutating billing call. It stays stable while the local row is
/// unchanged, so a client retry of the same action reuses it.
fn idempotency_key(sub: &Subscription, operation: &str) -> String {
    format!(
        "{}:{}:{}",
        sub.id,
        operation,
        sub.updated_at.timestamp_micros()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    /// Event older than the last one applied to this row.
    Stale,
    /// Nothing to materialize (incomplete payment, or unknown owner).
    Skipped,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionPage {
    pub subscriptions: Vec<Subscription>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

pub struct SubscriptionController {
    store: Arc<dyn SubscriptionStore>,
    billing: Arc<dyn BillingClient>,
    plans: Plans,
    app_base_url: String,
}

impl SubscriptionController {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        billing: Arc<dyn BillingClient>,
        plans: Plans,
        app_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            billing,
            plans,
            app_base_url: app_base_url.into(),
        }
    }

    /// The paywall predicate.
    pub async fn has_active_subscription(&self, user_id: Uuid) -> AppResult<bool> {
        self.store.has_active_subscription(user_id).await
    }

    pub async fn current_subscription(&self, user_id: Uuid) -> AppResult<Option<Subscription>> {
        self.store.current_subscription(user_id).await
    }

    async fn require_current(&self, user_id: Uuid) -> AppResult<Subscription> {
        self.store
            .current_subscription(user_id)
            .await?
            .ok_or_else(|| AppError::not_found("No active subscription"))
    }

    /// Writes the local row after the billing call succeeded. If the
    /// compare-and-set loses to a webhook that already applied the same change,
    /// the reconciled row is returned instead of a conflict.
    async fn commit_after_remote(
        &self,
        updated: Subscription,
        expected_updated_at: DateTime<Utc>,
        reached: impl Fn(&Subscription) -> bool,
    ) -> AppResult<Subscription> {
        match self.store.update_subscription(&updated, expected_updated_at).await {
            Ok(()) => Ok(updated),
            Err(AppError::Conflict(message)) => match self.store.subscription_by_id(updated.id).await? {
                Some(current) if reached(&current) => {
                    tracing::info!(subscription_id = %current.id, "Billing webhook already applied the change");
                    Ok(current)
                }
                _ => Err(AppError::Conflict(message)),
            },
            Err(e) => Err(e),
        }
    }

    fn price_for(&self, plan_id: &str) -> AppResult<&str> {
        self.plans
            .price_for(plan_id)
            .ok_or_else(|| AppError::validation(format!("Unknown plan: {plan_id}")))
    }

    /// Starts a remote checkout. The local row is created by the webhook once
    /// the billing system confirms payment.
    pub async fn subscribe(&self, user: &User, plan_id: &str) -> AppResult<CheckoutSession> {
        let price_id = self.price_for(plan_id)?.to_string();
        if self.store.has_active_subscription(user.id).await? {
            return Err(AppError::Conflict(
                "User already has an active subscription".to_string(),
            ));
        }

        let request = CheckoutRequest {
            user_id: user.id,
            customer_email: user.email.clone(),
            price_id,
            success_url: format!("{}/account/subscription?checkout=success", self.app_base_url),
            cancel_url: format!("{}/pricing?checkout=cancelled", self.app_base_url),
        };
        let session = self.billing.create_checkout_session(&request).await?;
        tracing::info!(user_id = %user.id, plan_id, session_id = %session.id, "Checkout session created");
        Ok(session)
    }

    /// Active -> ActivePendingCancel.
    pub async fn cancel_at_period_end(&self, user_id: Uuid) -> AppResult<Subscription> {
        let sub = self.require_current(user_id).await?;
        if sub.state() != SubscriptionState::Active {
            return Err(AppError::validation(
                "Subscription is already scheduled for cancellation",
            ));
        }

        self.billing
            .set_cancel_at_period_end(&sub.remote_id, true, &idempotency_key(&sub, "cancel"))
            .await?;

        let mut updated = sub.clone();
        updated.cancel_at_period_end = true;
        updated.updated_at = now();
        let updated = self
            .commit_after_remote(updated, sub.updated_at, |s| {
                s.state() == SubscriptionState::ActivePendingCancel
            })
            .await?;
        tracing::info!(user_id = %user_id, subscription_id = %sub.id, "Subscription set to cancel at period end");
        Ok(updated)
    }

    /// ActivePendingCancel -> Active.
    pub async fn resume(&self, user_id: Uuid) -> AppResult<Subscription> {
        let sub = self.require_current(user_id).await?;
        if sub.state() != SubscriptionState::ActivePendingCancel {
            return Err(AppError::validation(
                "Subscription is not scheduled for cancellation",
            ));
        }

        self.billing
            .set_cancel_at_period_end(&sub.remote_id, false, &idempotency_key(&sub, "resume"))
            .await?;

        let mut updated = sub.clone();
        updated.cancel_at_period_end = false;
        updated.canceled_at = None;
        updated.updated_at = now();
        let updated = self
            .commit_after_remote(updated, sub.updated_at, |s| {
                s.state() == SubscriptionState::Active
            })
            .await?;
        tracing::info!(user_id = %user_id, subscription_id = %sub.id, "Subscription resumed");
        Ok(updated)
    }

    pub async fn change_plan(&self, user_id: Uuid, new_plan: &str) -> AppResult<Subscription> {
        let price_id = self.price_for(new_plan)?.to_string();
        let sub = self.require_current(user_id).await?;
        if sub.plan_id == new_plan {
            return Err(AppError::validation("Subscription is already on this plan"));
        }

        let key = idempotency_key(&sub, &format!("plan-{new_plan}"));
        self.billing
            .change_price(&sub.remote_id, &price_id, &key)
            .await?;

        let mut updated = sub.clone();
        updated.plan_id = new_plan.to_string();
        updated.updated_at = now();
        let updated = self
            .commit_after_remote(updated, sub.updated_at, |s| {
                s.plan_id == new_plan && !s.status.is_terminal()
            })
            .await?;
        tracing::info!(user_id = %user_id, subscription_id = %sub.id, from = %sub.plan_id, to = new_plan, "Subscription plan changed");
        Ok(updated)
    }

    /// Immediate cancellation by an administrator; skips the pending state.
    pub async fn admin_cancel(&self, subscription_id: Uuid) -> AppResult<Subscription> {
        let sub = self
            .store
            .subscription_by_id(subscription_id)
            .await?
            .ok_or_else(|| AppError::not_found("Subscription not found"))?;
        if sub.status.is_terminal() {
            return Err(AppError::validation("Subscription is already terminated"));
        }

        self.billing
            .cancel_immediately(&sub.remote_id, &idempotency_key(&sub, "admin-cancel"))
            .await?;

        let at = now();
        let mut updated = sub.clone();
        updated.status = SubscriptionStatus::Cancelled;
        updated.cancel_at_period_end = false;
        updated.canceled_at = Some(at);
        updated.updated_at = at;
        let updated = self
            .commit_after_remote(updated, sub.updated_at, |s| s.status.is_terminal())
            .await?;
        tracing::warn!(subscription_id = %sub.id, user_id = %sub.user_id, "Subscription cancelled by admin");
        Ok(updated)
    }

    pub async fn list_subscriptions(&self, page: u32, per_page: u32) -> AppResult<SubscriptionPage> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        let offset = i64::from(page - 1) * i64::from(per_page);

        let (subscriptions, total) = tokio::try_join!(
            self.store.list_subscriptions(i64::from(per_page), offset),
            self.store.count_subscriptions(),
        )?;
        Ok(SubscriptionPage {
            subscriptions,
            total,
            page,
            per_page,
        })
    }

    /// Applies the billing system's view of a subscription. Idempotent by
    /// remote id; events older than the last applied one are ignored.
    pub async fn sync_remote(
        &self,
        remote: &RemoteSubscription,
        event_created: DateTime<Utc>,
    ) -> AppResult<SyncOutcome> {
        let Some(status) = remote.local_status() else {
            tracing::debug!(remote_id = %remote.id, status = %remote.status, "Remote subscription not usable yet");
            return Ok(SyncOutcome::Skipped);
        };

        match self.store.subscription_by_remote_id(&remote.id).await? {
            Some(existing) => self.apply_remote(existing, remote, status, event_created).await,
            None => self.create_from_remote(remote, status, event_created).await,
        }
    }

    async fn apply_remote(
        &self,
        existing: Subscription,
        remote: &RemoteSubscription,
        status: SubscriptionStatus,
        event_created: DateTime<Utc>,
    ) -> AppResult<SyncOutcome> {
        if existing.last_event_at.is_some_and(|last| event_created < last) {
            tracing::info!(remote_id = %remote.id, "Ignoring stale billing event");
            return Ok(SyncOutcome::Stale);
        }
        if existing.status.is_terminal() && !status.is_terminal() {
            // a terminated subscription never comes back; billing creates a new one
            tracing::warn!(remote_id = %remote.id, "Ignoring reactivation of terminated subscription");
            return Ok(SyncOutcome::Stale);
        }

        let mut updated = existing.clone();
        updated.status = status;
        updated.cancel_at_period_end = status == SubscriptionStatus::Active && remote.cancel_at_period_end;
        if let Some(plan) = remote
            .price_id
            .as_deref()
            .and_then(|price| self.plans.plan_for_price(price))
        {
            updated.plan_id = plan.to_string();
        }
        if let Some(end) = remote.current_period_end {
            updated.current_period_end = end;
        }
        updated.canceled_at = match status {
            SubscriptionStatus::Active => None,
            _ => remote.canceled_at.or(existing.canceled_at).or(Some(event_created)),
        };
        updated.last_event_at = Some(event_created);
        updated.updated_at = now();

        self.store.update_subscription(&updated, existing.updated_at).await?;
        tracing::info!(remote_id = %remote.id, status = ?updated.state(), "Subscription synced from billing");
        Ok(SyncOutcome::Updated)
    }

    async fn create_from_remote(
        &self,
        remote: &RemoteSubscription,
        status: SubscriptionStatus,
        event_created: DateTime<Utc>,
    ) -> AppResult<SyncOutcome> {
        let Some(user_id) = remote.user_id else {
            tracing::warn!(remote_id = %remote.id, "Billing subscription has no user_id metadata");
            return Ok(SyncOutcome::Skipped);
        };
        let plan_id = remote
            .price_id
            .as_deref()
            .and_then(|price| self.plans.plan_for_price(price))
            .ok_or_else(|| {
                AppError::validation(format!("Unknown price on subscription {}", remote.id))
            })?
            .to_string();

        let created_at = now();
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id,
            status,
            cancel_at_period_end: status == SubscriptionStatus::Active && remote.cancel_at_period_end,
            started_at: remote.current_period_start.unwrap_or(created_at),
            current_period_end: remote.current_period_end.unwrap_or(created_at),
            canceled_at: match status {
                SubscriptionStatus::Active => None,
                _ => remote.canceled_at.or(Some(event_created)),
            },
            remote_id: remote.id.clone(),
            last_event_at: Some(event_created),
            created_at,
            updated_at: created_at,
        };
        self.store.insert_subscription(&sub).await?;
        tracing::info!(user_id = %user_id, remote_id = %remote.id, "Subscription created from billing event");
        Ok(SyncOutcome::Created)
    }

    /// The billing system deleted the subscription (end of period or immediate).
    pub async fn mark_remote_deleted(
        &self,
        remote_id: &str,
        canceled_at: Option<DateTime<Utc>>,
        event_created: DateTime<Utc>,
    ) -> AppResult<SyncOutcome> {
        let Some(existing) = self.store.subscription_by_remote_id(remote_id).await? else {
            tracing::warn!(remote_id, "Deletion event for unknown subscription");
            return Ok(SyncOutcome::Skipped);
        };
        if existing.status == SubscriptionStatus::Cancelled {
            return Ok(SyncOutcome::Stale);
        }

        let mut updated = existing.clone();
        updated.status = SubscriptionStatus::Cancelled;
        updated.cancel_at_period_end = false;
        updated.canceled_at = canceled_at.or(existing.canceled_at).or(Some(event_created));
        updated.last_event_at = Some(event_created);
        updated.updated_at = now();
        self.store.update_subscription(&updated, existing.updated_at).await?;
        tracing::info!(remote_id, user_id = %existing.user_id, "Subscription cancelled by billing");
        Ok(SyncOutcome::Updated)
    }

    /// Re-reads a subscription from billing and syncs it; used when a checkout
    /// completes before the subscription events arrive. `event_created` is the
    /// triggering event's billing timestamp, never the local clock, so later
    /// events from the same second still compare as fresh.
    pub async fn refresh_from_remote(
        &self,
        remote_id: &str,
        event_created: DateTime<Utc>,
    ) -> AppResult<SyncOutcome> {
        let remote = self.billing.get_subscription(remote_id).await?;
        self.sync_remote(&remote, event_created).await
    }
}
