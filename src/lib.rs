// src/lib.rs
pub mod auth;
pub mod billing;
pub mod config;
pub mod counters;
pub mod db;
pub mod ephemeral;
pub mod error;
pub mod mailer;
pub mod models;
pub mod paywall;
pub mod recipes;
pub mod store;
pub mod subscriptions;
pub mod tokens;
pub mod webhook;

#[cfg(test)]
pub mod testing;
