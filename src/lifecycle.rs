//! Namespace service lifecycle across joined channels.
//!
//! The manager owns the service registry and the shared REST server. Each joined channel gets
//! a config watcher feeding a bounded queue and a worker that reconciles the channel's
//! services; see [`crate::reconcile`].

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::{
    batch::{BatchOptions, BatchStats, BatchWriter},
    cas::Cas,
    config::Config,
    config_store::ConfigStore,
    document::DocumentBuilder,
    ledger::LedgerProvider,
    queue::EventQueue,
    reconcile::{ChannelContext, ChannelWorker, WorkerOptions, spawn_channel_worker, stop_service},
    rest::{RestEndpoint, RestServer},
    watcher::{ChannelConfigWatcher, WatchTarget},
};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub msp_id: String,
    pub peer_id: String,
    pub config_chaincode: String,
    pub listen: SocketAddr,
    pub batch: BatchOptions,
    pub event_queue_capacity: usize,
    pub reconcile_debounce: Duration,
    pub reconcile_max_retries: u32,
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            msp_id: config.msp_id.clone(),
            peer_id: config.peer_id.clone(),
            config_chaincode: config.config_chaincode.clone(),
            listen: config.listen,
            batch: BatchOptions {
                timeout: Duration::from_millis(config.batch_writer_timeout_ms),
                ..Default::default()
            },
            event_queue_capacity: usize::try_from(config.event_queue_capacity)
                .unwrap_or(usize::MAX),
            reconcile_debounce: Duration::from_millis(config.reconcile_debounce_ms),
            reconcile_max_retries: config.reconcile_max_retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
}

pub struct RunningService {
    pub channel_id: String,
    pub namespace: String,
    pub base_path: String,
    pub state: ServiceState,
    pub started_at: DateTime<Utc>,
    pub app_config_fingerprint: String,
    endpoint: Option<Arc<RestEndpoint>>,
    writer: Option<Arc<BatchWriter>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub channel_id: String,
    pub namespace: String,
    pub base_path: String,
    pub state: ServiceState,
    pub started_at: String,
    pub app_config_fingerprint: String,
    pub batch: Option<BatchStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningSummary {
    pub base_path: String,
    pub fingerprint: String,
}

type ServiceKey = (String, String);

/// `(channel, namespace) -> RunningService`. Writers are the channel workers; readers copy
/// out under a short read lock.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<RwLock<BTreeMap<ServiceKey, RunningService>>>,
}

impl ServiceRegistry {
    fn key(channel_id: &str, namespace: &str) -> ServiceKey {
        (channel_id.to_string(), namespace.to_string())
    }

    pub(crate) fn insert_starting(
        &self,
        channel_id: &str,
        namespace: &str,
        base_path: &str,
        fingerprint: &str,
    ) {
        let service = RunningService {
            channel_id: channel_id.to_string(),
            namespace: namespace.to_string(),
            base_path: base_path.to_string(),
            state: ServiceState::Starting,
            started_at: Utc::now(),
            app_config_fingerprint: fingerprint.to_string(),
            endpoint: None,
            writer: None,
        };
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::key(channel_id, namespace), service);
    }

    pub(crate) fn set_running(
        &self,
        channel_id: &str,
        namespace: &str,
        endpoint: Arc<RestEndpoint>,
        writer: Arc<BatchWriter>,
    ) {
        let mut services = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(service) = services.get_mut(&Self::key(channel_id, namespace)) {
            service.state = ServiceState::Running;
            service.endpoint = Some(endpoint);
            service.writer = Some(writer);
        }
    }

    /// Marks the service `Stopping` and hands out its handles.
    #[allow(clippy::type_complexity)]
    pub(crate) fn begin_stopping(
        &self,
        channel_id: &str,
        namespace: &str,
    ) -> Option<(Option<Arc<RestEndpoint>>, Option<Arc<BatchWriter>>)> {
        let mut services = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let service = services.get_mut(&Self::key(channel_id, namespace))?;
        if service.state == ServiceState::Stopping {
            return None;
        }
        service.state = ServiceState::Stopping;
        Some((service.endpoint.clone(), service.writer.clone()))
    }

    pub(crate) fn remove(&self, channel_id: &str, namespace: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::key(channel_id, namespace));
    }

    /// Services on `channel_id` that are not being stopped.
    pub fn running_on(&self, channel_id: &str) -> BTreeMap<String, RunningSummary> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.channel_id == channel_id && s.state != ServiceState::Stopping)
            .map(|s| {
                (
                    s.namespace.clone(),
                    RunningSummary {
                        base_path: s.base_path.clone(),
                        fingerprint: s.app_config_fingerprint.clone(),
                    },
                )
            })
            .collect()
    }

    fn keys(&self, channel_id: Option<&str>) -> Vec<ServiceKey> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(channel, _)| channel_id.is_none_or(|c| c == channel.as_str()))
            .cloned()
            .collect()
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| ServiceStatus {
                channel_id: s.channel_id.clone(),
                namespace: s.namespace.clone(),
                base_path: s.base_path.clone(),
                state: s.state,
                started_at: s.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                app_config_fingerprint: s.app_config_fingerprint.clone(),
                batch: s.writer.as_ref().map(|w| w.stats()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    UnknownChannel { channel_id: String },
    Closed,
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChannel { channel_id } => write!(f, "unknown channel: {channel_id}"),
            Self::Closed => write!(f, "lifecycle manager is closed"),
        }
    }
}

impl std::error::Error for LifecycleError {}

struct JoinedChannel {
    watcher: ChannelConfigWatcher,
    worker: ChannelWorker,
}

#[derive(Default)]
struct Channels {
    joined: BTreeMap<String, JoinedChannel>,
    closed: bool,
}

pub struct LifecycleManager {
    opts: ManagerOptions,
    ledger: Arc<dyn LedgerProvider>,
    cas: Arc<dyn Cas>,
    builder: Arc<dyn DocumentBuilder>,
    rest: RestServer,
    registry: ServiceRegistry,
    channels: Mutex<Channels>,
}

impl LifecycleManager {
    pub fn new(
        opts: ManagerOptions,
        ledger: Arc<dyn LedgerProvider>,
        cas: Arc<dyn Cas>,
        builder: Arc<dyn DocumentBuilder>,
    ) -> Self {
        let rest = RestServer::new(opts.listen);
        Self {
            opts,
            ledger,
            cas,
            builder,
            rest,
            registry: ServiceRegistry::default(),
            channels: Mutex::new(Channels::default()),
        }
    }

    pub fn rest(&self) -> &RestServer {
        &self.rest
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        self.registry.status()
    }

    pub async fn joined_channels(&self) -> Vec<String> {
        self.channels.lock().await.joined.keys().cloned().collect()
    }

    /// Starts watching `channel_id` and reconciles it once. Joining twice is a no-op.
    pub async fn channel_joined(&self, channel_id: &str) -> Result<(), LifecycleError> {
        let mut channels = self.channels.lock().await;
        if channels.closed {
            return Err(LifecycleError::Closed);
        }
        if channels.joined.contains_key(channel_id) {
            return Ok(());
        }
        let ledger = self
            .ledger
            .channel(channel_id)
            .ok_or_else(|| LifecycleError::UnknownChannel {
                channel_id: channel_id.to_string(),
            })?;

        let queue = Arc::new(EventQueue::new(self.opts.event_queue_capacity));
        let (tracked_tx, tracked_rx) = watch::channel(BTreeSet::new());
        let watcher = ChannelConfigWatcher::new(
            channel_id,
            ledger.blocks.clone(),
            WatchTarget {
                msp_id: self.opts.msp_id.clone(),
                peer_id: self.opts.peer_id.clone(),
                config_chaincode: self.opts.config_chaincode.clone(),
            },
            tracked_rx,
            queue.clone(),
        );
        let ctx = Arc::new(ChannelContext {
            channel_id: channel_id.to_string(),
            msp_id: self.opts.msp_id.clone(),
            peer_id: self.opts.peer_id.clone(),
            config: ConfigStore::new(ledger.query.clone(), self.opts.config_chaincode.clone()),
            ledger,
            registry: self.registry.clone(),
            rest: self.rest.clone(),
            cas: self.cas.clone(),
            builder: self.builder.clone(),
            batch: self.opts.batch.clone(),
            tracked: tracked_tx,
        });

        // Watch first so nothing committed during the initial pass is missed.
        watcher.start();
        let worker = spawn_channel_worker(
            ctx,
            queue,
            WorkerOptions::new(self.opts.reconcile_debounce, self.opts.reconcile_max_retries),
        );
        channels
            .joined
            .insert(channel_id.to_string(), JoinedChannel { watcher, worker });
        info!(channel_id, "channel joined");
        Ok(())
    }

    /// Stops watching `channel_id` and tears down its services. Other channels are untouched.
    pub async fn channel_left(&self, channel_id: &str) {
        let joined = self.channels.lock().await.joined.remove(channel_id);
        let Some(joined) = joined else {
            return;
        };
        joined.watcher.stop();
        joined.worker.shutdown().await;
        self.stop_services(Some(channel_id)).await;
        info!(channel_id, "channel left");
    }

    /// Stops every worker, then every service concurrently, then the REST listener.
    pub async fn close(&self) {
        let joined = {
            let mut channels = self.channels.lock().await;
            if channels.closed {
                return;
            }
            channels.closed = true;
            std::mem::take(&mut channels.joined)
        };

        for joined in joined.values() {
            joined.watcher.stop();
        }
        join_all(joined.into_values().map(|j| j.worker.shutdown())).await;
        self.stop_services(None).await;
        self.rest.shutdown().await;
        info!("lifecycle manager closed");
    }

    async fn stop_services(&self, channel_id: Option<&str>) {
        let keys = self.registry.keys(channel_id);
        if keys.is_empty() {
            return;
        }
        let registry = &self.registry;
        join_all(
            keys.iter()
                .map(|(channel, namespace)| stop_service(registry, channel, namespace)),
        )
        .await;
        let left = self.registry.keys(channel_id);
        if !left.is_empty() {
            warn!(remaining = left.len(), "services still registered after stop");
        }
    }
}
