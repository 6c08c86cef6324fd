// src/store.rs
//! Persistence seams. `db::PgStore` implements all of them against Postgres;
//! `testing::MemoryStore` implements them in memory for unit tests.
use crate::error::AppResult;
use crate::models::{CounterMetric, Recipe, RecipeCounts, Subscription, User, VerificationToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait RecipeStore: Send + Sync {
    async fn get_recipe(&self, recipe_id: Uuid) -> AppResult<Option<Recipe>>;

    async fn durable_counts(&self, recipe_id: Uuid) -> AppResult<Option<RecipeCounts>>;

    /// Atomically adds `delta` to the durable column. `Ok(false)` means the
    /// recipe no longer exists.
    async fn apply_counter_delta(
        &self,
        recipe_id: Uuid,
        metric: CounterMetric,
        delta: i64,
    ) -> AppResult<bool>;
}

#[async_trait]
pub trait LikeStore: Send + Sync {
    /// `Ok(true)` when the (user, recipe) row was newly created.
    async fn insert_like(&self, user_id: Uuid, recipe_id: Uuid) -> AppResult<bool>;

    async fn has_liked(&self, user_id: Uuid, recipe_id: Uuid) -> AppResult<bool>;

    async fn liked_recipe_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Single-query access predicate: any row for the user whose status is not terminal.
    async fn has_active_subscription(&self, user_id: Uuid) -> AppResult<bool>;

    async fn current_subscription(&self, user_id: Uuid) -> AppResult<Option<Subscription>>;

    async fn subscription_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>>;

    async fn subscription_by_remote_id(&self, remote_id: &str) -> AppResult<Option<Subscription>>;

    /// Fails with `Conflict` if the user already has a non-terminal subscription
    /// or the remote id is taken.
    async fn insert_subscription(&self, sub: &Subscription) -> AppResult<()>;

    /// Compare-and-set on `updated_at`; fails with `Conflict` if the row changed
    /// since `expected_updated_at` was read.
    async fn update_subscription(
        &self,
        sub: &Subscription,
        expected_updated_at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn list_subscriptions(&self, limit: i64, offset: i64) -> AppResult<Vec<Subscription>>;

    async fn count_subscriptions(&self) -> AppResult<i64>;
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    async fn is_event_processed(&self, event_id: &str) -> AppResult<bool>;

    async fn mark_event_processed(&self, event_id: &str) -> AppResult<()>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user_by_username(&self, username: &str) -> AppResult<Option<User>>;

    async fn user_by_email(&self, email: &str) -> AppResult<Option<User>>;

    async fn user_by_id(&self, user_id: Uuid) -> AppResult<Option<User>>;

    async fn create_user(&self, user: &User) -> AppResult<()>;

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> AppResult<()>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Replaces any outstanding token for the same identifier.
    async fn save_token(&self, token: &VerificationToken) -> AppResult<()>;

    /// Deletes the matching token and returns it, so a token can be used once.
    async fn take_token(&self, identifier: &str, token: &str)
    -> AppResult<Option<VerificationToken>>;

    async fn delete_expired_tokens(&self, now: DateTime<Utc>) -> AppResult<u64>;
}
