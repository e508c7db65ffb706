//! Scripted provider and fixtures for source tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::*;
use crate::clock::ManualClock;
use crate::fast_store::{AdvisoryLock, MemoryFastStore};
use crate::jobs::testing::RecordingJobQueue;
use crate::repository::NewSource;
use crate::store::MemoryDurableStore;

pub const IMAGE_ID: &str = "img-1";
pub const FLAVOR_ID: &str = "flv-1";
pub const REGION_ID: &str = "reg-1";

#[derive(Default)]
struct FakeState {
    servers: Vec<ServerHandle>,
    destroyed: Vec<String>,
    created: usize,
    next_ip: u32,
    capacity: Option<usize>,
    reject_credentials: bool,
    fail_destroy: bool,
    resolved: HashMap<(ResourceKind, String), String>,
}

/// In-memory cloud whose servers come up only when told to
pub struct FakeProvider {
    ip_prefix: String,
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::with_ip_prefix("10.9.0")
    }

    pub fn with_ip_prefix(prefix: &str) -> Self {
        let mut resolved = HashMap::new();
        resolved.insert((ResourceKind::Image, "ubuntu".to_string()), IMAGE_ID.to_string());
        resolved.insert((ResourceKind::Flavor, "small".to_string()), FLAVOR_ID.to_string());
        resolved.insert((ResourceKind::Region, "nyc".to_string()), REGION_ID.to_string());

        Self {
            ip_prefix: prefix.to_string(),
            state: Mutex::new(FakeState {
                resolved,
                ..Default::default()
            }),
        }
    }

    fn handle(name: &str, ip: Option<&str>, ready: bool) -> ServerHandle {
        ServerHandle {
            id: format!("srv-{}", name),
            name: name.to_string(),
            public_ip: ip.map(str::to_string),
            image_id: IMAGE_ID.to_string(),
            flavor_id: FLAVOR_ID.to_string(),
            region_id: REGION_ID.to_string(),
            ready,
        }
    }

    pub fn add_ready_server(&self, name: &str, ip: &str) -> ServerHandle {
        let server = Self::handle(name, Some(ip), true);
        self.state.lock().servers.push(server.clone());
        server
    }

    pub fn add_building_server(&self, name: &str) -> ServerHandle {
        let server = Self::handle(name, None, false);
        self.state.lock().servers.push(server.clone());
        server
    }

    /// A server built from something else entirely
    pub fn add_foreign_server(&self, name: &str, ip: &str) -> ServerHandle {
        let mut server = Self::handle(name, Some(ip), true);
        server.image_id = "other".to_string();
        self.state.lock().servers.push(server.clone());
        server
    }

    /// Finish building every server, handing out addresses
    pub fn mark_all_ready(&self) {
        let mut state = self.state.lock();
        let mut next_ip = state.next_ip;
        for server in state.servers.iter_mut().filter(|s| !s.ready) {
            next_ip += 1;
            server.public_ip = Some(format!("{}.{}", self.ip_prefix, next_ip));
            server.ready = true;
        }
        state.next_ip = next_ip;
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = Some(capacity);
    }

    pub fn reject_credentials(&self) {
        self.state.lock().reject_credentials = true;
    }

    /// Make every later `destroy` fail with a provider error
    pub fn fail_destroy(&self, fail: bool) {
        self.state.lock().fail_destroy = fail;
    }

    pub fn forget_resource(&self, kind: ResourceKind, name: &str) {
        self.state.lock().resolved.remove(&(kind, name.to_string()));
    }

    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    pub fn servers(&self) -> Vec<ServerHandle> {
        self.state.lock().servers.clone()
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn list_servers(&self) -> ProviderResult<Vec<ServerHandle>> {
        let state = self.state.lock();
        if state.reject_credentials {
            return Err(ProviderError::InvalidCredentials);
        }
        Ok(state.servers.clone())
    }

    async fn create_server(&self, spec: &ServerSpec) -> ProviderResult<ServerHandle> {
        let mut state = self.state.lock();
        if state.reject_credentials {
            return Err(ProviderError::InvalidCredentials);
        }
        if let Some(capacity) = state.capacity {
            if state.servers.len() >= capacity {
                return Err(ProviderError::AtCapacity(format!(
                    "server limit of {} reached",
                    capacity
                )));
            }
        }
        let server = ServerHandle {
            id: format!("srv-{}", spec.name),
            name: spec.name.clone(),
            public_ip: None,
            image_id: spec.image_id.clone(),
            flavor_id: spec.flavor_id.clone(),
            region_id: spec.region_id.clone(),
            ready: false,
        };
        state.servers.push(server.clone());
        state.created += 1;
        Ok(server)
    }

    async fn destroy(&self, server: &ServerHandle) -> ProviderResult<()> {
        let mut state = self.state.lock();
        if state.fail_destroy {
            return Err(ProviderError::Other(anyhow::anyhow!(
                "destroy of {} rejected",
                server.name
            )));
        }
        state.servers.retain(|s| s.id != server.id);
        state.destroyed.push(server.id.clone());
        Ok(())
    }

    async fn resolve_name_to_id(&self, kind: ResourceKind, name: &str) -> ProviderResult<String> {
        let state = self.state.lock();
        if state.reject_credentials {
            return Err(ProviderError::InvalidCredentials);
        }
        state
            .resolved
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("{} {}", kind.as_str(), name)))
    }
}

pub fn cloud_config() -> Value {
    json!({
        "proxy_port": 3128,
        "api_key": "secret",
        "client_id": "client",
        "image_name": "ubuntu",
        "flavor_name": "small",
        "region_name": "nyc"
    })
}

/// A `SourceManager` over in-memory stores with DigitalOcean and Linode fakes
pub struct SourceFixture {
    pub clock: Arc<ManualClock>,
    pub durable: Arc<MemoryDurableStore>,
    pub fast: Arc<MemoryFastStore>,
    pub jobs: Arc<RecordingJobQueue>,
    pub keys: Keys,
    pub pool: ProxyPool,
    pub provider: Arc<FakeProvider>,
    pub linode: Arc<FakeProvider>,
    pub registry: Arc<ProviderRegistry>,
    pub settings: SourceSettings,
    pub manager: SourceManager,
}

impl SourceFixture {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
        let durable = Arc::new(MemoryDurableStore::new(clock.clone()));
        let fast = Arc::new(MemoryFastStore::new(clock.clone()));
        let jobs = Arc::new(RecordingJobQueue::new());
        let keys = Keys::new("test");
        let provider = Arc::new(FakeProvider::new());
        let linode = Arc::new(FakeProvider::with_ip_prefix("10.8.0"));

        let registry = Arc::new(
            ProviderRegistry::new()
                .register_fn(SourceType::DigitalOcean, {
                    let provider = provider.clone();
                    move |_, _| Ok(provider.clone() as Arc<dyn CloudProvider>)
                })
                .register_fn(SourceType::Linode, {
                    let linode = linode.clone();
                    move |_, _| Ok(linode.clone() as Arc<dyn CloudProvider>)
                }),
        );

        let settings = SourceSettings {
            server_ready_timeout: Duration::from_secs(60),
            server_poll_interval: Duration::from_secs(10),
            recent_decommissions_length: 3,
            max_source_errors: 5,
            create_concurrency: 2,
        };

        let lock = AdvisoryLock::new(
            fast.clone(),
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        let pool = ProxyPool::new(
            durable.clone(),
            fast.clone(),
            lock,
            keys.clone(),
            clock.clone(),
            jobs.clone(),
        );

        let manager = SourceManager::new(
            pool.clone(),
            durable.clone(),
            fast.clone(),
            keys.clone(),
            jobs.clone(),
            registry.clone(),
            clock.clone(),
            settings.clone(),
        );

        Self {
            clock,
            durable,
            fast,
            jobs,
            keys,
            pool,
            provider,
            linode,
            registry,
            settings,
            manager,
        }
    }

    pub async fn source(&self, kind: SourceType, name: &str, reliability: f64, max: i32, config: Value) -> Source {
        self.durable
            .create_source(NewSource {
                name: name.to_string(),
                source_type: kind.as_str().to_string(),
                reliability,
                max_proxies: max,
                config,
            })
            .await
            .unwrap()
    }

    /// A DigitalOcean source backed by `provider`
    pub async fn cloud_source(&self, name: &str, reliability: f64, max: i32) -> Source {
        self.source(SourceType::DigitalOcean, name, reliability, max, cloud_config())
            .await
    }

    /// A Linode source backed by `linode`
    pub async fn linode_source(&self, name: &str, reliability: f64, max: i32) -> Source {
        let config = json!({
            "proxy_port": "3128",
            "api_key": "secret",
            "image_name": "ubuntu",
            "flavor_name": "small",
            "data_center_name": "nyc"
        });
        self.source(SourceType::Linode, name, reliability, max, config)
            .await
    }

    pub async fn static_source(&self, name: &str, reliability: f64) -> Source {
        self.source(SourceType::Static, name, reliability, 0, json!({}))
            .await
    }

    pub fn errors(&self, source_id: i64) -> Vec<String> {
        self.durable
            .source_row(source_id)
            .map(|s| s.errors.0)
            .unwrap_or_default()
    }
}
