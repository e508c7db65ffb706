//! Cloud-backed sources: provisioning, orphan adoption and teardown.
//!
//! Creating a server is fire-and-forget. Readiness is discovered later by
//! `find_orphaned_servers`, which reschedules itself until every server is up
//! or the ready timeout has passed.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{
    server_name, CloudProvider, ProviderError, ResourceKind, ServerHandle, ServerSpec,
    SourceManager,
};
use crate::error::Result;
use crate::jobs::Job;
use crate::models::{CloudConfig, Proxy, Source, SourceType};

/// Resolved image, flavor and region ids of a cloud source
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Signature {
    pub image_id: String,
    pub flavor_id: String,
    pub region_id: String,
}

impl Signature {
    fn matches(&self, server: &ServerHandle) -> bool {
        server.matches(&self.image_id, &self.flavor_id, &self.region_id)
    }
}

/// A cloud source ready to talk to its provider
pub(super) struct CloudSource {
    pub provider: Arc<dyn CloudProvider>,
    pub config: CloudConfig,
    pub signature: Signature,
}

impl SourceManager {
    /// Build the provider for `source` and check its configuration.
    ///
    /// Any problem is written to the source's error log and yields `None`.
    pub(super) async fn connect(&self, source: &Source) -> Result<Option<CloudSource>> {
        let Some(kind) = source.type_enum().filter(SourceType::is_cloud) else {
            return Ok(None);
        };

        let config = match source.cloud_config() {
            Ok(config) => config,
            Err(e) => {
                self.record_error(source.id, e.to_string()).await?;
                return Ok(None);
            }
        };

        let Some(factory) = self.registry.get(kind) else {
            self.record_error(
                source.id,
                format!("No cloud provider registered for {}", kind.display_name()),
            )
            .await?;
            return Ok(None);
        };

        let provider = match factory.build(source, &config) {
            Ok(provider) => provider,
            Err(e) => {
                self.record_provider_error(source.id, &e).await?;
                return Ok(None);
            }
        };

        self.validate_config(source, provider, config).await
    }

    /// Resolve the configured names to ids through the provider.
    ///
    /// Runs before every provisioning attempt since a name may point at a
    /// resource deleted since the last run. Changed ids are written back.
    async fn validate_config(
        &self,
        source: &Source,
        provider: Arc<dyn CloudProvider>,
        mut config: CloudConfig,
    ) -> Result<Option<CloudSource>> {
        let lookups = [
            (ResourceKind::Image, config.image_name.clone()),
            (ResourceKind::Flavor, config.flavor_name.clone()),
            (ResourceKind::Region, config.region_name.clone()),
        ];

        let mut ids = Vec::with_capacity(lookups.len());
        for (kind, name) in lookups {
            match provider.resolve_name_to_id(kind, &name).await {
                Ok(id) => ids.push(id),
                Err(ProviderError::NotFound(_)) => {
                    self.record_error(
                        source.id,
                        format!("Could not find {} named {}", kind.as_str(), name),
                    )
                    .await?;
                    return Ok(None);
                }
                Err(e) => {
                    self.record_provider_error(source.id, &e).await?;
                    return Ok(None);
                }
            }
        }

        let [image_id, flavor_id, region_id]: [String; 3] = match ids.try_into() {
            Ok(ids) => ids,
            Err(_) => return Ok(None),
        };
        let signature = Signature {
            image_id,
            flavor_id,
            region_id,
        };

        let changed = config.image_id.as_deref() != Some(signature.image_id.as_str())
            || config.flavor_id.as_deref() != Some(signature.flavor_id.as_str())
            || config.region_id.as_deref() != Some(signature.region_id.as_str());

        if changed {
            config.image_id = Some(signature.image_id.clone());
            config.flavor_id = Some(signature.flavor_id.clone());
            config.region_id = Some(signature.region_id.clone());
            self.persist_resolved_ids(source, &signature).await?;
        }

        Ok(Some(CloudSource {
            provider,
            config,
            signature,
        }))
    }

    // Merge into the raw config so admin-only fields survive.
    async fn persist_resolved_ids(&self, source: &Source, signature: &Signature) -> Result<()> {
        let mut raw = source.config.0.clone();
        if let Value::Object(map) = &mut raw {
            map.insert("image_id".into(), Value::String(signature.image_id.clone()));
            map.insert("flavor_id".into(), Value::String(signature.flavor_id.clone()));
            map.insert("region_id".into(), Value::String(signature.region_id.clone()));
        }
        self.durable.update_source_config(source.id, &raw).await?;
        debug!(source_id = source.id, "Cached resolved provider ids");
        Ok(())
    }

    /// Handle a `ProvisionProxies` job: build servers up to `desired_total`,
    /// then start polling for them to come up.
    #[instrument(skip(self))]
    pub async fn provision(
        &self,
        source_id: i64,
        site_id: Option<i64>,
        desired_total: i64,
    ) -> Result<()> {
        let Some(source) = self.durable.get_source(source_id).await? else {
            debug!(source_id, "Source is gone, nothing to provision");
            return Ok(());
        };
        if !source.type_enum().is_some_and(|k| k.is_cloud()) {
            debug!(source_id, "Source does not provision");
            return Ok(());
        }
        let Some(cloud) = self.connect(&source).await? else {
            return Ok(());
        };

        let servers = match cloud.provider.list_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                self.record_provider_error(source.id, &e).await?;
                return Ok(());
            }
        };
        let recent = self
            .fast
            .lrange_all(&self.keys.recent_decommissions(source.id))
            .await?;
        let existing = servers
            .iter()
            .filter(|s| cloud.signature.matches(s) && !recent.contains(&s.name))
            .count() as i64;

        let to_create = (desired_total - existing).max(0) as usize;
        if to_create > 0 {
            self.create_servers(&source, &cloud, to_create).await?;
        }

        self.jobs
            .enqueue_in(
                self.settings.server_poll_interval,
                Job::FindOrphanedServers {
                    source_id: source.id,
                    site_id,
                    desired_total,
                    attempt: 0,
                },
            )
            .await?;
        Ok(())
    }

    async fn create_servers(&self, source: &Source, cloud: &CloudSource, count: usize) -> Result<()> {
        let specs: Vec<ServerSpec> = (0..count)
            .map(|_| ServerSpec {
                name: server_name(self.clock.now()),
                image_id: cloud.signature.image_id.clone(),
                flavor_id: cloud.signature.flavor_id.clone(),
                region_id: cloud.signature.region_id.clone(),
            })
            .collect();

        let provider = cloud.provider.clone();
        let results: Vec<_> = stream::iter(specs)
            .map(move |spec| {
                let provider = provider.clone();
                async move { provider.create_server(&spec).await }
            })
            .buffer_unordered(self.settings.create_concurrency.max(1))
            .collect()
            .await;

        let mut created = 0usize;
        let mut errors: Vec<String> = Vec::new();
        for result in results {
            match result {
                Ok(server) => {
                    created += 1;
                    debug!(source_id = source.id, server = %server.name, "Requested server");
                }
                Err(e) => {
                    let message = e.to_string();
                    if !errors.contains(&message) {
                        errors.push(message);
                    }
                }
            }
        }
        for message in errors {
            self.record_error(source.id, message).await?;
        }

        info!(source_id = source.id, requested = count, created, "Created servers");
        Ok(())
    }

    /// Handle a `FindOrphanedServers` job.
    ///
    /// Adopts ready servers that have no active proxy, joining them to the
    /// site until the source reaches `desired_total`. Reschedules itself while
    /// servers are still building or the source is short.
    #[instrument(skip(self))]
    pub async fn find_orphaned_servers(
        &self,
        source_id: i64,
        site_id: Option<i64>,
        desired_total: i64,
        attempt: u32,
    ) -> Result<()> {
        let Some(source) = self.durable.get_source(source_id).await? else {
            return Ok(());
        };
        let Some(cloud) = self.connect(&source).await? else {
            return Ok(());
        };

        let servers = match cloud.provider.list_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                self.record_provider_error(source.id, &e).await?;
                return Ok(());
            }
        };
        let recent = self
            .fast
            .lrange_all(&self.keys.recent_decommissions(source.id))
            .await?;

        let mut active = self.durable.count_active_proxies(source.id).await?;
        let mut building = 0usize;
        let mut adopted = 0usize;

        for server in servers.iter().filter(|s| cloud.signature.matches(s)) {
            if recent.contains(&server.name) {
                continue;
            }
            let Some(ip) = server.public_ip.as_deref().filter(|_| server.ready) else {
                building += 1;
                continue;
            };
            if self.durable.active_proxy_host_exists(ip).await? {
                continue;
            }

            let join_site = if active < desired_total { site_id } else { None };
            if self
                .add_proxy(&source, ip, cloud.config.proxy_port, join_site)
                .await?
                .is_some()
            {
                active += 1;
                adopted += 1;
            }
        }

        if adopted > 0 {
            info!(source_id, ?site_id, adopted, active, "Adopted orphaned servers");
        }

        if building == 0 && active >= desired_total {
            return Ok(());
        }

        let poll = self.settings.server_poll_interval;
        let waited = poll * (attempt + 1);
        if waited < self.settings.server_ready_timeout {
            self.jobs
                .enqueue_in(
                    poll,
                    Job::FindOrphanedServers {
                        source_id,
                        site_id,
                        desired_total,
                        attempt: attempt + 1,
                    },
                )
                .await?;
        } else {
            warn!(source_id, building, active, desired_total, "Gave up waiting for servers");
            self.record_error(
                source_id,
                format!(
                    "Timed out after {}s waiting for servers ({} still building, {} of {} proxies)",
                    waited.as_secs(),
                    building,
                    active,
                    desired_total
                ),
            )
            .await?;
        }
        Ok(())
    }

    /// Destroy the server behind `proxy`.
    ///
    /// True once no server is left behind it; false when the provider could
    /// not be reached or refused, with the error on the source's log.
    pub(super) async fn decommission_server(&self, source: &Source, proxy: &Proxy) -> Result<bool> {
        let Some(cloud) = self.connect(source).await? else {
            return Ok(false);
        };

        let servers = match cloud.provider.list_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                self.record_provider_error(source.id, &e).await?;
                return Ok(false);
            }
        };
        let Some(server) = servers
            .into_iter()
            .find(|s| s.public_ip.as_deref() == Some(proxy.host.as_str()))
        else {
            debug!(source_id = source.id, host = %proxy.host, "No server behind proxy");
            return Ok(true);
        };

        match cloud.provider.destroy(&server).await {
            Ok(()) => info!(source_id = source.id, server = %server.name, "Destroyed server"),
            Err(ProviderError::NotFound(_)) => {
                debug!(source_id = source.id, server = %server.name, "Server already destroyed")
            }
            Err(e) => {
                self.record_provider_error(source.id, &e).await?;
                return Ok(false);
            }
        }

        // The provider may keep listing it for a while; keep orphan searches off it.
        self.fast
            .lpush_capped(
                &self.keys.recent_decommissions(source.id),
                &server.name,
                self.settings.recent_decommissions_length,
            )
            .await?;
        Ok(true)
    }

    async fn record_provider_error(&self, source_id: i64, error: &ProviderError) -> Result<()> {
        self.record_error(source_id, error.to_string()).await
    }
}
