// src/bin/flush_counters.rs
//! One-shot counter flush, meant to be run from cron.
use recipe_paywall::config::Config;
use recipe_paywall::counters::CounterService;
use recipe_paywall::db::PgStore;
use recipe_paywall::ephemeral;
use recipe_paywall::error::{AppError, AppResult};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> AppResult<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    dotenv::dotenv().ok();
    let config = Config::from_env().map_err(|e| AppError::internal(format!("Config error: {e}")))?;

    let pool = PgPool::connect(&config.database_url).await?;
    let store = Arc::new(PgStore::new(pool));
    // the in-process buffer lives in the server; only a shared one can be flushed from here
    let redis_url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| AppError::internal("REDIS_URL must be set to flush counters"))?;
    let counter_buffer = ephemeral::connect(Some(redis_url)).await?;

    let counters = CounterService::new(
        counter_buffer,
        store.clone(),
        store,
        Duration::from_secs(config.flush_lock_ttl_secs),
    );
    if let Err(e) = counters.flush().await {
        tracing::error!(error = %e, "Counter flush failed");
        return Err(e);
    }
    Ok(())
}
