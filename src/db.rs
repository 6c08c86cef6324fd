// src/db.rs
use crate::error::{AppError, AppResult};
use crate::models::{
    CounterMetric, Recipe, RecipeCounts, Subscription, User, VerificationToken,
};
use crate::store::{
    LikeStore, RecipeStore, SubscriptionStore, TokenStore, UserStore, WebhookEventStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, status, cancel_at_period_end, started_at, \
     current_period_end, canceled_at, remote_id, last_event_at, created_at, updated_at";

/// Postgres-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl RecipeStore for PgStore {
    async fn get_recipe(&self, recipe_id: Uuid) -> AppResult<Option<Recipe>> {
        let recipe = sqlx::query_as::<_, Recipe>(
            "SELECT id, title, body, is_premium, view_count, like_count, created_at FROM recipes WHERE id = $1",
        )
        .bind(recipe_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(recipe)
    }

    async fn durable_counts(&self, recipe_id: Uuid) -> AppResult<Option<RecipeCounts>> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT view_count, like_count FROM recipes WHERE id = $1")
                .bind(recipe_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(views, likes)| RecipeCounts { views, likes }))
    }

    async fn apply_counter_delta(
        &self,
        recipe_id: Uuid,
        metric: CounterMetric,
        delta: i64,
    ) -> AppResult<bool> {
        // column name comes from a closed enum, never from input
        let sql = format!(
            "UPDATE recipes SET {col} = {col} + $2 WHERE id = $1",
            col = metric.column()
        );
        let result = sqlx::query(&sql)
            .bind(recipe_id)
            .bind(delta)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl LikeStore for PgStore {
    async fn insert_like(&self, user_id: Uuid, recipe_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "INSERT INTO recipe_likes (user_id, recipe_id, created_at) VALUES ($1, $2, NOW()) ON CONFLICT (user_id, recipe_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(recipe_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn has_liked(&self, user_id: Uuid, recipe_id: Uuid) -> AppResult<bool> {
        let liked: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM recipe_likes WHERE user_id = $1 AND recipe_id = $2)",
        )
        .bind(user_id)
        .bind(recipe_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(liked)
    }

    async fn liked_recipe_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT recipe_id FROM recipe_likes WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn has_active_subscription(&self, user_id: Uuid) -> AppResult<bool> {
        let active: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE user_id = $1 AND status NOT IN ('CANCELLED', 'EXPIRED'))",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }

    async fn current_subscription(&self, user_id: Uuid) -> AppResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 AND status NOT IN ('CANCELLED', 'EXPIRED')"
        );
        let sub = sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn subscription_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1");
        let sub = sqlx::query_as::<_, Subscription>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn subscription_by_remote_id(&self, remote_id: &str) -> AppResult<Option<Subscription>> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE remote_id = $1");
        let sub = sqlx::query_as::<_, Subscription>(&sql)
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn insert_subscription(&self, sub: &Subscription) -> AppResult<()> {
        let sql = format!(
            "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        );
        sqlx::query(&sql)
            .bind(sub.id)
            .bind(sub.user_id)
            .bind(&sub.plan_id)
            .bind(sub.status)
            .bind(sub.cancel_at_period_end)
            .bind(sub.started_at)
            .bind(sub.current_period_end)
            .bind(sub.canceled_at)
            .bind(&sub.remote_id)
            .bind(sub.last_event_at)
            .bind(sub.created_at)
            .bind(sub.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict("User already has an active subscription".to_string())
                } else {
                    AppError::Database(e)
                }
            })?;
        Ok(())
    }

    async fn update_subscription(
        &self,
        sub: &Subscription,
        expected_updated_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET plan_id = $2, status = $3, cancel_at_period_end = $4, \
             current_period_end = $5, canceled_at = $6, last_event_at = $7, updated_at = $8 \
             WHERE id = $1 AND updated_at = $9",
        )
        .bind(sub.id)
        .bind(&sub.plan_id)
        .bind(sub.status)
        .bind(sub.cancel_at_period_end)
        .bind(sub.current_period_end)
        .bind(sub.canceled_at)
        .bind(sub.last_event_at)
        .bind(sub.updated_at)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict("User already has an active subscription".to_string())
            } else {
                AppError::Database(e)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(
                "Subscription was modified concurrently, retry".to_string(),
            ));
        }
        Ok(())
    }

    async fn list_subscriptions(&self, limit: i64, offset: i64) -> AppResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        );
        let subs = sqlx::query_as::<_, Subscription>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(subs)
    }

    async fn count_subscriptions(&self) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl WebhookEventStore for PgStore {
    async fn is_event_processed(&self, event_id: &str) -> AppResult<bool> {
        let processed: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM webhook_events WHERE event_id = $1)")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(processed)
    }

    async fn mark_event_processed(&self, event_id: &str) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO webhook_events (event_id, processed_at) VALUES ($1, NOW()) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, role, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, role, created_at FROM users WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn user_by_id(&self, user_id: Uuid) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, role, created_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_user(&self, user: &User) -> AppResult<()> {
        sqlx::query("INSERT INTO users (id, username, email, password_hash, role, created_at) VALUES ($1, $2, $3, $4, $5, $6)")
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.role)
            .bind(user.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict("Username or email already exists".to_string())
                } else {
                    AppError::Database(e)
                }
            })?;
        Ok(())
    }

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> AppResult<()> {
        let result = sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("User not found"));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn save_token(&self, token: &VerificationToken) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM verification_tokens WHERE identifier = $1")
            .bind(&token.identifier)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO verification_tokens (identifier, token, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(&token.identifier)
        .bind(&token.token)
        .bind(token.expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn take_token(
        &self,
        identifier: &str,
        token: &str,
    ) -> AppResult<Option<VerificationToken>> {
        let taken = sqlx::query_as::<_, VerificationToken>(
            "DELETE FROM verification_tokens WHERE identifier = $1 AND token = $2 RETURNING identifier, token, expires_at",
        )
        .bind(identifier)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(taken)
    }

    async fn delete_expired_tokens(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM verification_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
