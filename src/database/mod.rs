//! Durable store connection management and schema

pub mod migrations;
pub mod pool;

pub use pool::Database;
