//! Zartan - self-replenishing proxy pool
//!
//! Hands scraping clients the least recently used proxy for a site, tracks how
//! each proxy performs there, evicts the ones that fail, and provisions
//! replacements from the sources that have served the site best.
//!
//! ## Layout
//!
//! - `pool`: per-site LRU selection with cooldown under an advisory lock
//! - `lease`: per-client reservations of proxies that are still cooling down
//! - `health`: success and failure counters, eviction
//! - `requestor`: demand-driven provisioning across sources
//! - `sources`: cloud and static sources, ownership conflicts
//! - `jobs`: background work and its runner

pub mod api;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod fast_store;
pub mod health;
pub mod jobs;
pub mod lease;
pub mod models;
pub mod pool;
pub mod repository;
pub mod requestor;
pub mod services;
pub mod sources;
pub mod store;

pub use config::Config;
pub use database::Database;
pub use error::{Result, ZartanError};
