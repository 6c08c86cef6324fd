// src/main.rs
use actix_web::{App, HttpServer, middleware::Logger, web};
use recipe_paywall::billing::{BillingClient, Plans, StripeClient};
use recipe_paywall::config::Config;
use recipe_paywall::counters::CounterService;
use recipe_paywall::db::PgStore;
use recipe_paywall::mailer::{LogMailer, Mailer};
use recipe_paywall::store::{RecipeStore, UserStore};
use recipe_paywall::subscriptions::SubscriptionController;
use recipe_paywall::tokens::PasswordResets;
use recipe_paywall::webhook::{SignatureVerifier, WebhookProcessor};
use recipe_paywall::{auth, ephemeral, paywall, recipes};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    tracing::info!("Starting recipe service");

    dotenv::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");

    let pool = PgPool::connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    let store = Arc::new(PgStore::new(pool));
    let counter_buffer = ephemeral::connect(config.redis_url.as_deref())
        .await
        .expect("Failed to connect to counter buffer");
    let billing: Arc<dyn BillingClient> =
        Arc::new(StripeClient::from_config(&config).expect("Failed to build billing client"));
    let mailer: Arc<dyn Mailer> = Arc::new(LogMailer::new(config.mail_from.clone()));

    let counters = web::Data::new(CounterService::new(
        counter_buffer,
        store.clone(),
        store.clone(),
        Duration::from_secs(config.flush_lock_ttl_secs),
    ));
    let subscriptions = Arc::new(SubscriptionController::new(
        store.clone(),
        billing,
        Plans::from_config(&config),
        config.app_base_url.clone(),
    ));
    let webhooks = web::Data::new(WebhookProcessor::new(
        SignatureVerifier::new(
            config.stripe_webhook_secret.clone(),
            config.webhook_tolerance_secs,
        ),
        store.clone(),
        subscriptions.clone(),
    ));
    let resets = web::Data::new(PasswordResets::new(
        store.clone(),
        store.clone(),
        mailer,
        config.app_base_url.clone(),
    ));
    let users: Arc<dyn UserStore> = store.clone();
    let recipe_store: Arc<dyn RecipeStore> = store;
    let users = web::Data::from(users);
    let recipe_store = web::Data::from(recipe_store);
    let subscriptions = web::Data::from(subscriptions);
    let recipe_cache = web::Data::new(recipes::recipe_cache());

    let bind_addr = config.bind_addr.clone();
    let config = web::Data::new(config);
    tracing::info!(%bind_addr, "Listening");

    HttpServer::new(move || {
        App::new()
            .app_data(config.clone())
            .app_data(users.clone())
            .app_data(recipe_store.clone())
            .app_data(recipe_cache.clone())
            .app_data(counters.clone())
            .app_data(subscriptions.clone())
            .app_data(webhooks.clone())
            .app_data(resets.clone())
            .wrap(Logger::default())
            .configure(auth::init_routes)
            .configure(recipes::init_routes)
            .configure(paywall::init_routes)
    })
    .bind(bind_addr)?
    .run()
    .await
}
