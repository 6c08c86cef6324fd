// src/testing.rs
//! In-memory fakes for the store, billing and mail seams.
use crate::billing::{BillingClient, CheckoutRequest, CheckoutSession, Plans, RemoteSubscription};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::mailer::{Email, Mailer};
use crate::models::{
    CounterMetric, Recipe, RecipeCounts, Subscription, User, VerificationToken, ROLE_USER,
};
use crate::store::{
    LikeStore, RecipeStore, SubscriptionStore, TokenStore, UserStore, WebhookEventStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub fn test_plans() -> Plans {
    Plans::new([("basic", "price_basic"), ("premium", "price_premium")])
}

pub fn test_config() -> Config {
    Config::from_iter(
        [
            ("DATABASE_URL", "postgres://localhost/recipes_test"),
            ("JWT_SECRET", "test-secret"),
            ("STRIPE_SECRET_KEY", "sk_test"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_test"),
            ("STRIPE_PRICE_BASIC", "price_basic"),
            ("STRIPE_PRICE_PREMIUM", "price_premium"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string())),
    )
    .expect("test config")
}

pub fn test_user() -> User {
    let id = Uuid::new_v4();
    User {
        id,
        username: format!("cook-{}", id.simple()),
        email: format!("cook-{}@example.com", id.simple()),
        password_hash: bcrypt::hash("password-123", 4).expect("hash"),
        role: ROLE_USER.to_string(),
        created_at: Utc::now(),
    }
}

pub fn remote_subscription(id: &str, user_id: Uuid, status: &str, price: &str) -> RemoteSubscription {
    let now = Utc::now();
    RemoteSubscription {
        id: id.to_string(),
        status: status.to_string(),
        cancel_at_period_end: false,
        price_id: Some(price.to_string()),
        current_period_start: Some(now),
        current_period_end: Some(now + Duration::days(30)),
        canceled_at: None,
        user_id: Some(user_id),
    }
}

#[derive(Default)]
struct Inner {
    recipes: HashMap<Uuid, Recipe>,
    likes: HashMap<(Uuid, Uuid), DateTime<Utc>>,
    subscriptions: HashMap<Uuid, Subscription>,
    events: HashSet<String>,
    users: HashMap<Uuid, User>,
    tokens: Vec<VerificationToken>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_counter_updates: AtomicBool,
}

impl MemoryStore {
    pub fn add_recipe(&self, title: &str, is_premium: bool) -> Uuid {
        let recipe = Recipe {
            id: Uuid::new_v4(),
            title: title.to_string(),
            body: format!("How to make {title}"),
            is_premium,
            view_count: 0,
            like_count: 0,
            created_at: Utc::now(),
        };
        let id = recipe.id;
        self.inner.lock().unwrap().recipes.insert(id, recipe);
        id
    }

    pub fn set_durable(&self, recipe_id: Uuid, counts: RecipeCounts) {
        let mut inner = self.inner.lock().unwrap();
        let recipe = inner.recipes.get_mut(&recipe_id).expect("recipe");
        recipe.view_count = counts.views;
        recipe.like_count = counts.likes;
    }

    pub fn durable(&self, recipe_id: Uuid) -> RecipeCounts {
        let inner = self.inner.lock().unwrap();
        let recipe = &inner.recipes[&recipe_id];
        RecipeCounts {
            views: recipe.view_count,
            likes: recipe.like_count,
        }
    }

    pub fn like_rows(&self, recipe_id: Uuid) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.likes.keys().filter(|(_, r)| *r == recipe_id).count()
    }

    pub fn fail_counter_updates(&self, fail: bool) {
        self.fail_counter_updates.store(fail, Ordering::SeqCst);
    }

    pub fn add_user(&self, user: User) {
        self.inner.lock().unwrap().users.insert(user.id, user);
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }

    pub fn current_for(&self, user_id: Uuid) -> Option<Subscription> {
        let inner = self.inner.lock().unwrap();
        inner
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && !s.status.is_terminal())
            .cloned()
    }
}

#[async_trait]
impl RecipeStore for MemoryStore {
    async fn get_recipe(&self, recipe_id: Uuid) -> AppResult<Option<Recipe>> {
        Ok(self.inner.lock().unwrap().recipes.get(&recipe_id).cloned())
    }

    async fn durable_counts(&self, recipe_id: Uuid) -> AppResult<Option<RecipeCounts>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.recipes.get(&recipe_id).map(|r| RecipeCounts {
            views: r.view_count,
            likes: r.like_count,
        }))
    }

    async fn apply_counter_delta(
        &self,
        recipe_id: Uuid,
        metric: CounterMetric,
        delta: i64,
    ) -> AppResult<bool> {
        if self.fail_counter_updates.load(Ordering::SeqCst) {
            return Err(AppError::internal("simulated database outage"));
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.recipes.get_mut(&recipe_id) {
            Some(recipe) => {
                match metric {
                    CounterMetric::View => recipe.view_count += delta,
                    CounterMetric::Like => recipe.like_count += delta,
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl LikeStore for MemoryStore {
    async fn insert_like(&self, user_id: Uuid, recipe_id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.likes.contains_key(&(user_id, recipe_id)) {
            return Ok(false);
        }
        inner.likes.insert((user_id, recipe_id), Utc::now());
        Ok(true)
    }

    async fn has_liked(&self, user_id: Uuid, recipe_id: Uuid) -> AppResult<bool> {
        Ok(self.inner.lock().unwrap().likes.contains_key(&(user_id, recipe_id)))
    }

    async fn liked_recipe_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let inner = self.inner.lock().unwrap();
        let mut liked: Vec<(DateTime<Utc>, Uuid)> = inner
            .likes
            .iter()
            .filter(|((u, _), _)| *u == user_id)
            .map(|((_, r), at)| (*at, *r))
            .collect();
        liked.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(liked.into_iter().map(|(_, r)| r).collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn has_active_subscription(&self, user_id: Uuid) -> AppResult<bool> {
        Ok(self.current_for(user_id).is_some())
    }

    async fn current_subscription(&self, user_id: Uuid) -> AppResult<Option<Subscription>> {
        Ok(self.current_for(user_id))
    }

    async fn subscription_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        Ok(self.inner.lock().unwrap().subscriptions.get(&id).cloned())
    }

    async fn subscription_by_remote_id(&self, remote_id: &str) -> AppResult<Option<Subscription>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .subscriptions
            .values()
            .find(|s| s.remote_id == remote_id)
            .cloned())
    }

    async fn insert_subscription(&self, sub: &Subscription) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let clash = inner.subscriptions.values().any(|s| {
            s.remote_id == sub.remote_id
                || (s.user_id == sub.user_id
                    && !s.status.is_terminal()
                    && !sub.status.is_terminal())
        });
        if clash {
            return Err(AppError::Conflict(
                "User already has an active subscription".to_string(),
            ));
        }
        inner.subscriptions.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn update_subscription(
        &self,
        sub: &Subscription,
        expected_updated_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.subscriptions.get_mut(&sub.id) {
            Some(stored) if stored.updated_at == expected_updated_at => {
                *stored = sub.clone();
                Ok(())
            }
            _ => Err(AppError::Conflict(
                "Subscription was modified concurrently, retry".to_string(),
            )),
        }
    }

    async fn list_subscriptions(&self, limit: i64, offset: i64) -> AppResult<Vec<Subscription>> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<Subscription> = inner.subscriptions.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count_subscriptions(&self) -> AppResult<i64> {
        Ok(self.inner.lock().unwrap().subscriptions.len() as i64)
    }
}

#[async_trait]
impl WebhookEventStore for MemoryStore {
    async fn is_event_processed(&self, event_id: &str) -> AppResult<bool> {
        Ok(self.inner.lock().unwrap().events.contains(event_id))
    }

    async fn mark_event_processed(&self, event_id: &str) -> AppResult<()> {
        self.inner.lock().unwrap().events.insert(event_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.values().find(|u| u.username == username).cloned())
    }

    async fn user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn user_by_id(&self, user_id: Uuid) -> AppResult<Option<User>> {
        Ok(self.inner.lock().unwrap().users.get(&user_id).cloned())
    }

    async fn create_user(&self, user: &User) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .users
            .values()
            .any(|u| u.username == user.username || u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(AppError::Conflict(
                "Username or email already exists".to_string(),
            ));
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::not_found("User not found"))?;
        user.password_hash = password_hash.to_string();
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn save_token(&self, token: &VerificationToken) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.retain(|t| t.identifier != token.identifier);
        inner.tokens.push(token.clone());
        Ok(())
    }

    async fn take_token(
        &self,
        identifier: &str,
        token: &str,
    ) -> AppResult<Option<VerificationToken>> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner
            .tokens
            .iter()
            .position(|t| t.identifier == identifier && t.token == token);
        Ok(position.map(|i| inner.tokens.remove(i)))
    }

    async fn delete_expired_tokens(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.tokens.len();
        inner.tokens.retain(|t| t.expires_at > now);
        Ok((before - inner.tokens.len()) as u64)
    }
}

#[derive(Default)]
struct BillingState {
    subscriptions: HashMap<String, RemoteSubscription>,
    checkouts: Vec<(Uuid, String)>,
    idempotency_keys: Vec<String>,
    failing: bool,
}

/// Billing fake that keeps remote subscriptions in memory.
#[derive(Default)]
pub struct MockBillingClient {
    state: Mutex<BillingState>,
}

impl MockBillingClient {
    pub fn add_subscription(&self, remote: RemoteSubscription) {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .insert(remote.id.clone(), remote);
    }

    pub fn remote(&self, remote_id: &str) -> RemoteSubscription {
        self.state.lock().unwrap().subscriptions[remote_id].clone()
    }

    pub fn checkouts(&self) -> Vec<(Uuid, String)> {
        self.state.lock().unwrap().checkouts.clone()
    }

    pub fn idempotency_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().idempotency_keys.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    fn mutate(
        &self,
        remote_id: &str,
        idempotency_key: &str,
        apply: impl FnOnce(&mut RemoteSubscription),
    ) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        state.idempotency_keys.push(idempotency_key.to_string());
        if state.failing {
            return Err(AppError::Billing("simulated outage".to_string()));
        }
        let remote = state
            .subscriptions
            .get_mut(remote_id)
            .ok_or_else(|| AppError::Billing(format!("No such subscription: {remote_id}")))?;
        apply(remote);
        Ok(())
    }
}

#[async_trait]
impl BillingClient for MockBillingClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> AppResult<CheckoutSession> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(AppError::Billing("simulated outage".to_string()));
        }
        state
            .checkouts
            .push((request.user_id, request.price_id.clone()));
        let id = format!("cs_test_{}", state.checkouts.len());
        Ok(CheckoutSession {
            url: format!("https://checkout.test/{id}"),
            id,
        })
    }

    async fn get_subscription(&self, remote_id: &str) -> AppResult<RemoteSubscription> {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .get(remote_id)
            .cloned()
            .ok_or_else(|| AppError::Billing(format!("No such subscription: {remote_id}")))
    }

    async fn set_cancel_at_period_end(
        &self,
        remote_id: &str,
        cancel: bool,
        idempotency_key: &str,
    ) -> AppResult<()> {
        self.mutate(remote_id, idempotency_key, |remote| {
            remote.cancel_at_period_end = cancel;
        })
    }

    async fn cancel_immediately(&self, remote_id: &str, idempotency_key: &str) -> AppResult<()> {
        self.mutate(remote_id, idempotency_key, |remote| {
            remote.status = "canceled".to_string();
            remote.canceled_at = Some(Utc::now());
        })
    }

    async fn change_price(
        &self,
        remote_id: &str,
        price_id: &str,
        idempotency_key: &str,
    ) -> AppResult<()> {
        self.mutate(remote_id, idempotency_key, |remote| {
            remote.price_id = Some(price_id.to_string());
        })
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Email>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &Email) -> AppResult<()> {
        if self.fail {
            return Err(AppError::internal("smtp unreachable"));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}
