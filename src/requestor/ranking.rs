use crate::error::Result;
use crate::models::Source;
use crate::store::DurableStore;

/// A source with its historical success ratio on one site
#[derive(Debug, Clone)]
pub struct RankedSource {
    pub source: Source,
    pub ratio: f64,
}

/// Success ratio from summed counters; sources without history get 1.0 so
/// they are tried.
pub fn success_ratio(succeeded: i64, failed: i64) -> f64 {
    let total = succeeded + failed;
    if total <= 0 {
        1.0
    } else {
        succeeded as f64 / total as f64
    }
}

/// Every active source ordered by its success ratio on `site_id`, best first.
///
/// The sort is stable, so equally ranked sources keep id order.
pub async fn rank_sources(durable: &dyn DurableStore, site_id: i64) -> Result<Vec<RankedSource>> {
    let mut ranked = Vec::new();
    for source in durable.list_sources().await? {
        let (succeeded, failed) = durable.source_site_totals(source.id, site_id).await?;
        ranked.push(RankedSource {
            ratio: success_ratio(succeeded, failed),
            source,
        });
    }
    ranked.sort_by(|a, b| b.ratio.total_cmp(&a.ratio));
    Ok(ranked)
}
