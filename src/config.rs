// src/config.rs
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    /// Unset means the in-process counter buffer is used (single instance only).
    #[serde(default)]
    pub redis_url: Option<String>,
    pub stripe_secret_key: String,
    #[serde(default = "default_stripe_api_url")]
    pub stripe_api_url: String,
    pub stripe_webhook_secret: String,
    pub stripe_price_basic: String,
    pub stripe_price_premium: String,
    #[serde(default = "default_app_base_url")]
    pub app_base_url: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: i64,
    #[serde(default = "default_flush_lock_ttl_secs")]
    pub flush_lock_ttl_secs: u64,
    #[serde(default = "default_mail_from")]
    pub mail_from: String,
}

fn default_stripe_api_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_app_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_webhook_tolerance_secs() -> i64 {
    300
}

fn default_flush_lock_ttl_secs() -> u64 {
    120
}

fn default_mail_from() -> String {
    "no-reply@localhost".to_string()
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    pub fn from_iter<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(vars)
    }
}
