//! API server implementation
//!
//! A thin HTTP facade over the lease cache, the pool and the health tracker.

pub mod handlers;
pub mod response;
pub mod routes;
pub mod server;

pub use response::ApiResponse;
pub use server::{ApiServer, AppState};
