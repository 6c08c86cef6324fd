// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef, Postgres};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct Recipe {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub is_premium: bool,
    pub view_count: i64,
    pub like_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct UserLike {
    pub user_id: Uuid,
    pub recipe_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Which buffered counter an increment belongs to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CounterMetric {
    View,
    Like,
}

impl CounterMetric {
    pub const ALL: [CounterMetric; 2] = [CounterMetric::View, CounterMetric::Like];

    pub fn as_str(&self) -> &'static str {
        match self {
            CounterMetric::View => "view",
            CounterMetric::Like => "like",
        }
    }

    /// Column on `recipes` holding the durable total.
    pub fn column(&self) -> &'static str {
        match self {
            CounterMetric::View => "view_count",
            CounterMetric::Like => "like_count",
        }
    }
}

impl fmt::Display for CounterMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecipeCounts {
    pub views: i64,
    pub likes: i64,
}

impl RecipeCounts {
    pub fn get(&self, metric: CounterMetric) -> i64 {
        match metric {
            CounterMetric::View => self.views,
            CounterMetric::Like => self.likes,
        }
    }

    pub fn add(&mut self, metric: CounterMetric, delta: i64) {
        match metric {
            CounterMetric::View => self.views += delta,
            CounterMetric::Like => self.likes += delta,
        }
    }
}

/// Persisted subscription status. The pending-cancel sub-state is the
/// `cancel_at_period_end` flag on an `Active` row.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Expired => "EXPIRED",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "CANCELLED" => Ok(SubscriptionStatus::Cancelled),
            "EXPIRED" => Ok(SubscriptionStatus::Expired),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

// Stored as TEXT; the CHECK constraint in the schema keeps it to the three values.
impl sqlx::Type<Postgres> for SubscriptionStatus {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <String as sqlx::Type<Postgres>>::compatible(ty)
    }
}

impl sqlx::Encode<'_, Postgres> for SubscriptionStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
        <&str as sqlx::Encode<Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for SubscriptionStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<Postgres>>::decode(value)?;
        Ok(raw.parse()?)
    }
}

/// Lifecycle state as seen by callers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    Active,
    ActivePendingCancel,
    Cancelled,
    Expired,
}

impl SubscriptionState {
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Active | SubscriptionState::ActivePendingCancel
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub started_at: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub remote_id: String,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        match self.status {
            SubscriptionStatus::Active if self.cancel_at_period_end => {
                SubscriptionState::ActivePendingCancel
            }
            SubscriptionStatus::Active => SubscriptionState::Active,
            SubscriptionStatus::Cancelled => SubscriptionState::Cancelled,
            SubscriptionStatus::Expired => SubscriptionState::Expired,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct VerificationToken {
    pub identifier: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Claims {
    pub sub: String, // user_id
    pub role: String,
    pub exp: usize,
}

#[derive(Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Serialize, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    pub token: String,
    pub new_password: String,
}

#[derive(Serialize, Deserialize)]
pub struct LikeRequest {
    pub recipe_id: Uuid,
}

#[derive(Serialize, Deserialize)]
pub struct PlanRequest {
    pub plan_id: String,
}

#[derive(Serialize, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(status: SubscriptionStatus, cancel_at_period_end: bool) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: "basic".to_string(),
            status,
            cancel_at_period_end,
            started_at: now,
            current_period_end: now,
            canceled_at: None,
            remote_id: "sub_1".to_string(),
            last_event_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn pending_cancel_is_derived_from_flag() {
        assert_eq!(
            subscription(SubscriptionStatus::Active, true).state(),
            SubscriptionState::ActivePendingCancel
        );
        assert_eq!(
            subscription(SubscriptionStatus::Active, false).state(),
            SubscriptionState::Active
        );
        // a stale flag on a terminal row does not resurrect access
        assert_eq!(
            subscription(SubscriptionStatus::Cancelled, true).state(),
            SubscriptionState::Cancelled
        );
    }

    #[test]
    fn status_text_round_trips() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
        assert!("PAUSED".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn only_non_terminal_states_grant_access() {
        assert!(SubscriptionState::Active.grants_access());
        assert!(SubscriptionState::ActivePendingCancel.grants_access());
        assert!(!SubscriptionState::Cancelled.grants_access());
        assert!(!SubscriptionState::Expired.grants_access());
    }
}
