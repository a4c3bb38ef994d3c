//! The engine facade: construction, lifecycle, and the request/response API
//! offered to external callers.
use crate::bus::{Subscription, SubscriptionBus};
use crate::constants;
use crate::freeze::{FreezeError, FreezeOptions, FreezeRegistry, FreezeSource, SnapshotScope};
use crate::mapping::{LoadedMapping, MappingError, MappingRepository};
use crate::monitor::{self, BatchJob};
use crate::property::encode::EncodeError;
use crate::property::state::StateMap;
use crate::property::{self, PropertyContext, PropertyError, ValidationEvent};
use crate::store::MemoryStore;
use crate::utils::now_ms;
use retrocmd::{ClientConfig, RetroClient, TransportError};
use shared::event::{ChangeEvent, ChangeSource};
use shared::rpc::{
    BatchOutcome, Glossary, GlossaryComputed, GlossaryGroup, GlossaryProperty, MappingSummary,
    PropertyStateView,
};
use shared::{BatchOperation, SubscriptionFilter, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Store(#[from] crate::store::StoreError),

    #[error("{0}")]
    Property(#[from] PropertyError),

    #[error("{0}")]
    Mapping(#[from] MappingError),

    #[error("{0}")]
    Freeze(#[from] FreezeError),

    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Construction-time options; everything has a workable default.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub host: String,
    pub port: u16,
    /// Platform name seeding the transport chunk policy before a mapping
    /// declares its own.
    pub platform_hint: Option<String>,
    pub request_timeout: Duration,
    pub tick_interval: Duration,
    pub write_back_interval: Duration,
    pub probe_interval: Duration,
    pub subscriber_queue: usize,
    pub worker_pool: usize,
    pub history_size: usize,
    pub batch_queue: usize,
    pub batch_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: constants::DEFAULT_PORT,
            platform_hint: None,
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            tick_interval: constants::DEFAULT_TICK_INTERVAL,
            write_back_interval: constants::DEFAULT_WRITE_BACK_INTERVAL,
            probe_interval: constants::DEFAULT_PROBE_INTERVAL,
            subscriber_queue: constants::DEFAULT_SUBSCRIBER_QUEUE,
            worker_pool: constants::DEFAULT_WORKER_POOL,
            history_size: constants::DEFAULT_HISTORY_SIZE,
            batch_queue: constants::DEFAULT_BATCH_QUEUE,
            batch_timeout: constants::DEFAULT_BATCH_TIMEOUT,
        }
    }
}

impl EngineOptions {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_platform_hint(mut self, platform: impl Into<String>) -> Self {
        self.platform_hint = Some(platform.into());
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_write_back_interval(mut self, write_back_interval: Duration) -> Self {
        self.write_back_interval = write_back_interval;
        self
    }

    pub fn with_probe_interval(mut self, probe_interval: Duration) -> Self {
        self.probe_interval = probe_interval;
        self
    }

    pub fn with_subscriber_queue(mut self, subscriber_queue: usize) -> Self {
        self.subscriber_queue = subscriber_queue;
        self
    }

    pub fn with_worker_pool(mut self, worker_pool: usize) -> Self {
        self.worker_pool = worker_pool;
        self
    }

    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size;
        self
    }

    pub fn with_batch_queue(mut self, batch_queue: usize) -> Self {
        self.batch_queue = batch_queue;
        self
    }

    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }
}

pub(crate) struct EngineInner {
    pub(crate) options: EngineOptions,
    pub(crate) repository: Arc<dyn MappingRepository>,
    pub(crate) transport: RetroClient,
    pub(crate) store: MemoryStore,
    pub(crate) freeze: Arc<FreezeRegistry>,
    pub(crate) states: StateMap,
    pub(crate) bus: Arc<SubscriptionBus>,
    pub(crate) snapshot: SnapshotScope,
    pub(crate) loaded: RwLock<Option<Arc<LoadedMapping>>>,
}

impl EngineInner {
    pub(crate) fn current(&self) -> Option<Arc<LoadedMapping>> {
        self.loaded.read().unwrap().clone()
    }

    fn current_or(&self, name: &str) -> Result<Arc<LoadedMapping>, PropertyError> {
        self.current()
            .ok_or_else(|| PropertyError::NotFound(name.to_string()))
    }

    pub(crate) fn property_ctx<'a>(&'a self, loaded: &'a LoadedMapping) -> PropertyContext<'a> {
        PropertyContext {
            store: &self.store,
            states: &self.states,
            loaded,
            snapshot: &self.snapshot,
        }
    }

    /// Name of the property whose range starts at `addr`, for freeze events.
    pub(crate) fn property_name_at(&self, loaded: &LoadedMapping, addr: u32) -> Option<String> {
        loaded
            .mapping
            .properties
            .iter()
            .find(|(_, p)| p.address == addr)
            .map(|(name, _)| name.clone())
    }

    pub(crate) fn publish_validation_events(
        &self,
        loaded: &LoadedMapping,
        name: &str,
        events: &[ValidationEvent],
    ) {
        if !loaded.mapping.validation.emit_events {
            return;
        }
        for event in events {
            self.bus.publish(&ChangeEvent::ValidationFailed {
                name: name.to_string(),
                rule: event.rule.clone(),
                message: event.message.clone(),
                value: event.value.clone(),
                timestamp_ms: now_ms(),
            });
        }
    }

    pub(crate) fn get_property(&self, name: &str) -> Result<Value, EngineError> {
        let loaded = self.current_or(name)?;
        let ctx = self.property_ctx(&loaded);
        let outcome = property::evaluate(&ctx, name)?;
        self.publish_validation_events(&loaded, name, &outcome.events);
        Ok(outcome.value)
    }

    pub(crate) async fn set_property_value(
        &self,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let loaded = self.current_or(name)?;
        let prop = self.writable_property(&loaded, name)?;

        {
            let ctx = self.property_ctx(&loaded);
            property::validate_strict(&ctx, name, &value)?;
        }

        let endian = loaded.mapping.endianness_of(prop);
        let bytes = property::encode::encode(
            &self.store,
            &loaded.mapping,
            &value,
            &prop.kind,
            prop.address,
            prop.width,
            endian,
        )
        .map_err(|err| match err {
            EncodeError::Store(e) => EngineError::Store(e),
            other => EngineError::Property(PropertyError::UnsupportedWrite {
                name: name.to_string(),
                reason: other.to_string(),
            }),
        })?;

        self.write_through(&loaded, name, prop.address, &bytes).await
    }

    pub(crate) async fn set_property_bytes(
        &self,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), EngineError> {
        let loaded = self.current_or(name)?;
        let prop = self.writable_property(&loaded, name)?;
        if bytes.len() != prop.width {
            return Err(PropertyError::UnsupportedWrite {
                name: name.to_string(),
                reason: format!(
                    "property holds {} byte(s), got {}",
                    prop.width,
                    bytes.len()
                ),
            }
            .into());
        }
        self.write_through(&loaded, name, prop.address, &bytes).await
    }

    fn writable_property<'a>(
        &self,
        loaded: &'a LoadedMapping,
        name: &str,
    ) -> Result<&'a crate::mapping::Property, EngineError> {
        if loaded.mapping.computed.contains_key(name) {
            return Err(PropertyError::Computed(name.to_string()).into());
        }
        let prop = loaded
            .mapping
            .properties
            .get(name)
            .ok_or_else(|| PropertyError::NotFound(name.to_string()))?;
        if prop.read_only {
            return Err(PropertyError::ReadOnly(name.to_string()).into());
        }
        if self.freeze.range_frozen(prop.address, prop.width) {
            return Err(PropertyError::Frozen(name.to_string()).into());
        }
        Ok(prop)
    }

    /// Cache patch, transport push, state/snapshot update, api-sourced event.
    async fn write_through(
        &self,
        loaded: &Arc<LoadedMapping>,
        name: &str,
        addr: u32,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        // No cached block yet just means there is nothing to patch locally.
        let _ = self.store.patch(addr, bytes);
        self.transport.write_bytes(addr, bytes).await?;
        self.states.observe_write(name);

        let ctx = self.property_ctx(loaded);
        let outcome = property::evaluate(&ctx, name)?;
        let old_value = {
            let mut snapshot = self.snapshot.write().unwrap();
            snapshot.insert(name.to_string(), outcome.value.clone())
        };
        self.publish_validation_events(loaded, name, &outcome.events);
        self.bus.publish(&ChangeEvent::PropertyChanged {
            name: name.to_string(),
            old_value,
            new_value: outcome.value,
            timestamp_ms: now_ms(),
            source: ChangeSource::Api,
        });
        Ok(())
    }

    pub(crate) async fn freeze_property(
        &self,
        name: &str,
        frozen: bool,
    ) -> Result<(), EngineError> {
        let loaded = self.current_or(name)?;
        if loaded.mapping.computed.contains_key(name) {
            return Err(PropertyError::Computed(name.to_string()).into());
        }
        let prop = loaded
            .mapping
            .properties
            .get(name)
            .ok_or_else(|| PropertyError::NotFound(name.to_string()))?;

        if frozen {
            if !prop.freezable {
                return Err(FreezeError::Conflict(format!(
                    "property \"{name}\" is not freezable"
                ))
                .into());
            }
            let bytes = self
                .store
                .read_bytes(prop.address, prop.width)
                .unwrap_or_else(|_| vec![0; prop.width]);
            self.freeze
                .freeze(prop.address, bytes, FreezeOptions::default())?;
        } else {
            self.freeze.unfreeze(prop.address)?;
        }
        self.bus.publish(&ChangeEvent::PropertyFreezeChanged {
            name: name.to_string(),
            frozen,
            timestamp_ms: now_ms(),
        });
        Ok(())
    }
}

/// The memory-introspection engine.
///
/// Constructed with [`Engine::connect`]; owned by the process entrypoint
/// and handed to collaborators explicitly.
pub struct Engine {
    inner: Arc<EngineInner>,
    batch_tx: mpsc::Sender<BatchJob>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Connects the transport and starts the monitor and batch processor.
    pub async fn connect(
        options: EngineOptions,
        repository: Arc<dyn MappingRepository>,
    ) -> Result<Self, EngineError> {
        let mut client_config = ClientConfig::default()
            .with_host(options.host.clone())
            .with_port(options.port)
            .with_request_timeout(options.request_timeout);
        if let Some(platform) = &options.platform_hint {
            client_config = client_config.with_platform(platform.clone());
        }
        let transport = RetroClient::connect(client_config).await?;

        let snapshot: SnapshotScope = Arc::new(RwLock::new(HashMap::new()));
        let freeze = Arc::new(FreezeRegistry::new(snapshot.clone()));
        let store = MemoryStore::new(freeze.clone());
        let bus = SubscriptionBus::new(options.subscriber_queue);
        let states = StateMap::new(options.history_size);

        let inner = Arc::new(EngineInner {
            options: options.clone(),
            repository,
            transport,
            store,
            freeze,
            states,
            bus,
            snapshot,
            loaded: RwLock::new(None),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (batch_tx, batch_rx) = mpsc::channel(options.batch_queue.max(1));

        let monitor_task = tokio::spawn(monitor::run(inner.clone(), shutdown_rx.clone()));
        let batch_task = tokio::spawn(monitor::batch_loop(inner.clone(), batch_rx, shutdown_rx));

        Ok(Self {
            inner,
            batch_tx,
            shutdown_tx,
            tasks: Mutex::new(vec![monitor_task, batch_task]),
        })
    }

    pub fn list_mappings(&self) -> Vec<String> {
        self.inner.repository.list()
    }

    /// Atomically replaces the loaded mapping.
    ///
    /// On failure the previous mapping stays active. On success the first
    /// event any subscriber sees from the new mapping is `MapperLoaded`.
    pub fn load_mapping(&self, name: &str) -> Result<(), EngineError> {
        let mapping = self
            .inner
            .repository
            .get(name)
            .ok_or_else(|| MappingError::NotFound(name.to_string()))?;
        let loaded = Arc::new(LoadedMapping::compile(mapping)?);

        {
            let mut slot = self.inner.loaded.write().unwrap();
            self.inner.store.clear();
            self.inner.states.clear();
            self.inner.freeze.clear();
            self.inner.snapshot.write().unwrap().clear();
            *slot = Some(loaded.clone());
        }

        self.inner.bus.publish(&ChangeEvent::MapperLoaded {
            name: loaded.mapping.name.clone(),
            timestamp_ms: now_ms(),
        });

        // Default-frozen properties are pinned in the same transition; their
        // bytes start zeroed until the first region fetch refreshes them.
        for (prop_name, prop) in &loaded.mapping.properties {
            if !prop.default_frozen || !prop.freezable {
                continue;
            }
            let result = self.inner.freeze.freeze(
                prop.address,
                vec![0; prop.width],
                FreezeOptions {
                    source: FreezeSource::Default,
                    ..Default::default()
                },
            );
            match result {
                Ok(()) => self.inner.bus.publish(&ChangeEvent::PropertyFreezeChanged {
                    name: prop_name.clone(),
                    frozen: true,
                    timestamp_ms: now_ms(),
                }),
                Err(err) => {
                    tracing::warn!(property = %prop_name, error = %err, "default freeze failed")
                }
            }
        }
        Ok(())
    }

    pub fn current_mapping_summary(&self) -> Option<MappingSummary> {
        let loaded = self.inner.current()?;
        let mapping = &loaded.mapping;
        Some(MappingSummary {
            name: mapping.name.clone(),
            game: mapping.game.clone(),
            version: mapping.version.clone(),
            platform: mapping.platform.name.clone(),
            property_count: mapping.properties.len(),
            group_count: mapping.groups.len(),
            computed_count: mapping.computed.len(),
            region_count: mapping.platform.regions.len(),
        })
    }

    pub fn current_mapping_glossary(&self) -> Option<Glossary> {
        let loaded = self.inner.current()?;
        let mapping = &loaded.mapping;
        Some(Glossary {
            properties: mapping
                .properties
                .iter()
                .map(|(name, p)| GlossaryProperty {
                    name: name.clone(),
                    kind: p.kind.name().to_string(),
                    address: p.address,
                    width: p.width as u32,
                    read_only: p.read_only,
                    freezable: p.freezable,
                    description: p.description.clone(),
                })
                .collect(),
            groups: mapping
                .groups
                .iter()
                .map(|(name, g)| GlossaryGroup {
                    name: name.clone(),
                    properties: g.properties.clone(),
                    display_name: g.display_name.clone(),
                })
                .collect(),
            computed: mapping
                .computed
                .iter()
                .map(|(name, node)| GlossaryComputed {
                    name: name.clone(),
                    expression: node.expression.clone(),
                    dependencies: node.dependencies.clone(),
                })
                .collect(),
        })
    }

    pub fn get_property(&self, name: &str) -> Result<Value, EngineError> {
        self.inner.get_property(name)
    }

    pub fn get_property_state(&self, name: &str) -> Option<PropertyStateView> {
        let loaded = self.inner.current()?;
        let frozen = loaded
            .mapping
            .properties
            .get(name)
            .is_some_and(|p| self.inner.freeze.range_frozen(p.address, p.width));
        self.inner.states.view(name, frozen)
    }

    pub async fn set_property_value(&self, name: &str, value: Value) -> Result<(), EngineError> {
        self.inner.set_property_value(name, value).await
    }

    pub async fn set_property_bytes(&self, name: &str, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.inner.set_property_bytes(name, bytes).await
    }

    pub async fn freeze_property(&self, name: &str, frozen: bool) -> Result<(), EngineError> {
        self.inner.freeze_property(name, frozen).await
    }

    /// Queues a batch and waits for its outcome.
    pub async fn batch_update(
        &self,
        ops: Vec<BatchOperation>,
        atomic: bool,
    ) -> Result<BatchOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.batch_tx
            .send(BatchJob {
                ops,
                atomic,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        reply_rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.inner.bus.subscribe(filter)
    }

    /// Stops the monitor, batch processor, and transport; subscribers get a
    /// final `Shutdown` event and their queues close.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        self.inner.transport.close();
        self.inner.bus.shutdown();
    }
}
