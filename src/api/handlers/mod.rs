//! API request handlers

pub mod health;
pub mod v1;
pub mod v2;

use crate::api::server::AppState;
use crate::error::Result;
use crate::models::Site;
use crate::pool::{Outcome, ANY_AGE};

/// Cooldown in seconds from the `older_than` parameter; absent means any age
pub(crate) fn cooldown(older_than: Option<i64>) -> i64 {
    older_than.unwrap_or(ANY_AGE)
}

/// Look a site up by name, creating it with default bounds on first use.
///
/// `None` for names that cannot be sites.
pub(crate) async fn site_named(state: &AppState, name: &str) -> Result<Option<Site>> {
    if !Site::is_valid_name(name) {
        return Ok(None);
    }
    state.durable.find_or_create_site(name).await.map(Some)
}

/// Record a client's report; unknown or unaffiliated proxies are ignored
pub(crate) async fn report(state: &AppState, site: &Site, proxy_id: i64, outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Succeeded => state.health.proxy_succeeded(site.id, proxy_id).await,
        Outcome::Failed => state.health.proxy_failed(site.id, proxy_id).await,
    }
}
