//! Per-channel reconciliation of running namespace services against committed config.
//!
//! One worker task per channel consumes [`ConfigChanged`] events. Events that arrive while a
//! pass runs (or within the debounce window) coalesce into a single follow-up pass. Every pass
//! re-reads the peer record and converges the channel's services to it, so passes are
//! idempotent and the event contents are only used for logging.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::Duration,
};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    batch::{BatchContext, BatchOptions, spawn_batch_writer},
    cas::Cas,
    config_store::{
        ConfigError, ConfigKey, ConfigStore, ConfigValue, GLOBAL_MSP_ID, NAMESPACE_APP_VERSION,
        SIDETREE_APP_NAME, SIDETREE_APP_VERSION,
    },
    document::DocumentBuilder,
    ledger::{ChannelLedger, LedgerError},
    lifecycle::ServiceRegistry,
    opstore::OperationStore,
    peer_config::{DesiredNamespaces, NamespaceAppConfig, NamespaceConfig, PeerConfig},
    protocol::{ProtocolError, ProtocolVersionSet},
    queue::{EventQueue, QueuedEvent},
    rest::{NamespaceRoute, RestError, RestServer},
    watcher::{ConfigChangeKind, ConfigChanged},
};

/// Why a namespace could not be started. The namespace stays absent.
#[derive(Debug)]
pub enum StartupError {
    MissingAppConfig { namespace: String },
    InvalidAppConfig { namespace: String, reason: String },
    NoProtocolVersions { namespace: String },
    Store(LedgerError),
    Rest(RestError),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingAppConfig { namespace } => {
                write!(f, "application config not found for {namespace}")
            }
            Self::InvalidAppConfig { namespace, reason } => {
                write!(f, "invalid application config for {namespace}: {reason}")
            }
            Self::NoProtocolVersions { namespace } => {
                write!(f, "no valid protocol versions for {namespace}")
            }
            Self::Store(e) => write!(f, "{e}"),
            Self::Rest(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Rest(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RestError> for StartupError {
    fn from(value: RestError) -> Self {
        Self::Rest(value)
    }
}

/// A pass that hit a transient ledger error and should be retried.
#[derive(Debug)]
pub struct ReconcileError {
    pub source: LedgerError,
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reconcile: {}", self.source)
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.restarted.is_empty()
            && self.failed.is_empty()
    }
}

/// Everything a channel's worker needs; shared with the lifecycle manager.
pub struct ChannelContext {
    pub channel_id: String,
    pub msp_id: String,
    pub peer_id: String,
    pub ledger: ChannelLedger,
    pub config: ConfigStore,
    pub registry: ServiceRegistry,
    pub rest: RestServer,
    pub cas: Arc<dyn Cas>,
    pub builder: Arc<dyn DocumentBuilder>,
    pub batch: BatchOptions,
    /// Namespaces named by the latest peer record; read by the channel's block filter.
    pub tracked: watch::Sender<BTreeSet<String>>,
}

impl ChannelContext {
    fn peer_key(&self) -> ConfigKey {
        ConfigKey::peer(
            &self.msp_id,
            &self.peer_id,
            SIDETREE_APP_NAME,
            SIDETREE_APP_VERSION,
        )
    }
}

#[derive(Debug, Default)]
struct PendingBatch {
    full: bool,
    peer: bool,
    apps: BTreeSet<String>,
    protocols: BTreeSet<String>,
}

impl PendingBatch {
    fn has_any(&self) -> bool {
        self.full || self.peer || !self.apps.is_empty() || !self.protocols.is_empty()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }

    fn add(&mut self, event: QueuedEvent<ConfigChanged>) {
        match event {
            QueuedEvent::RecomputeAll => self.full = true,
            QueuedEvent::Event(event) => match event.kind {
                ConfigChangeKind::Peer => self.peer = true,
                ConfigChangeKind::App { namespace } => {
                    self.apps.insert(namespace);
                }
                ConfigChangeKind::Protocol { namespace } => {
                    self.protocols.insert(namespace);
                }
            },
        }
    }
}

/// How a failing pass is retried: the delay doubles from `base` up to `cap`, plus up to
/// `1/jitter_divisor` of it at random. After `max_attempts` retries the worker gives up until
/// the next config event.
#[derive(Debug, Clone)]
struct RetryPolicy {
    base: Duration,
    cap: Duration,
    jitter_divisor: u32,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based), without jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .map_or(self.cap, |factor| self.base.saturating_mul(factor))
            .min(self.cap)
    }
}

#[derive(Debug)]
struct RetryState<R> {
    policy: RetryPolicy,
    attempts: u32,
    rng: R,
}

impl<R: Rng> RetryState<R> {
    fn new(policy: RetryPolicy, rng: R) -> Self {
        Self {
            policy,
            attempts: 0,
            rng,
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    /// `None` once the retries are used up.
    fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;

        let jitter_ms = match self.policy.jitter_divisor {
            0 => 0,
            divisor => {
                let max = delay.as_millis() as u64 / u64::from(divisor);
                self.rng.gen_range(0..=max)
            }
        };
        Some((delay + Duration::from_millis(jitter_ms)).min(self.policy.cap))
    }
}

#[derive(Debug)]
pub struct WorkerOptions<R> {
    pub debounce: Duration,
    retry: RetryPolicy,
    rng: R,
}

impl WorkerOptions<StdRng> {
    pub fn new(debounce: Duration, max_retries: u32) -> Self {
        Self {
            debounce,
            retry: RetryPolicy {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(30),
                jitter_divisor: 4,
                max_attempts: max_retries,
            },
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for WorkerOptions<StdRng> {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), 5)
    }
}

impl<R> WorkerOptions<R> {
    pub fn with_retry_delays(mut self, base: Duration, cap: Duration) -> Self {
        self.retry.base = base;
        self.retry.cap = cap;
        self
    }
}

/// Handle to a running channel worker.
pub struct ChannelWorker {
    queue: Arc<EventQueue<ConfigChanged>>,
    task: JoinHandle<()>,
}

impl ChannelWorker {
    /// Closes the queue and waits for an in-flight pass to finish.
    pub async fn shutdown(self) {
        if !self.queue.is_empty() {
            debug!(pending = self.queue.len(), "discarding queued config events");
        }
        self.queue.close();
        if let Err(err) = self.task.await {
            warn!(error = %err, "channel worker task failed");
        }
    }
}

/// Starts the worker. It runs one full pass right away.
pub fn spawn_channel_worker<R: Rng + Send + 'static>(
    ctx: Arc<ChannelContext>,
    queue: Arc<EventQueue<ConfigChanged>>,
    options: WorkerOptions<R>,
) -> ChannelWorker {
    let task = tokio::spawn(worker_task(ctx, queue.clone(), options));
    ChannelWorker { queue, task }
}

async fn worker_task<R: Rng>(
    ctx: Arc<ChannelContext>,
    queue: Arc<EventQueue<ConfigChanged>>,
    options: WorkerOptions<R>,
) {
    let mut pending = PendingBatch {
        full: true,
        ..Default::default()
    };
    let mut debounce_until: Option<Instant> = Some(Instant::now());
    let mut retry_at: Option<Instant> = None;
    let mut retry = RetryState::new(options.retry, options.rng);

    loop {
        let now = Instant::now();
        let run_at = if pending.has_any() {
            let debounce_at = debounce_until.unwrap_or(now);
            Some(debounce_at.max(retry_at.unwrap_or(now)))
        } else {
            None
        };

        tokio::select! {
            maybe = queue.pop() => {
                match maybe {
                    Some(event) => {
                        pending.add(event);
                        debounce_until = Some(Instant::now() + options.debounce);
                    }
                    None => break,
                }
            }
            _ = async {
                if let Some(at) = run_at {
                    tokio::time::sleep_until(at).await;
                }
            }, if run_at.is_some() => {
                debounce_until = None;
                debug!(
                    channel_id = %ctx.channel_id,
                    full = pending.full,
                    peer = pending.peer,
                    apps = ?pending.apps,
                    protocols = ?pending.protocols,
                    "reconcile pass"
                );
                match reconcile_channel(&ctx).await {
                    Ok(outcome) => {
                        if !outcome.is_noop() {
                            info!(
                                channel_id = %ctx.channel_id,
                                started = ?outcome.started,
                                stopped = ?outcome.stopped,
                                restarted = ?outcome.restarted,
                                failed = outcome.failed.len(),
                                "channel reconciled"
                            );
                        }
                        pending.clear();
                        retry.reset();
                        retry_at = None;
                    }
                    Err(err) => match retry.next_delay() {
                        Some(delay) => {
                            warn!(
                                channel_id = %ctx.channel_id,
                                error = %err,
                                attempt = retry.attempts,
                                ?delay,
                                "reconcile failed; retrying"
                            );
                            retry_at = Some(Instant::now() + delay);
                        }
                        None => {
                            warn!(
                                channel_id = %ctx.channel_id,
                                error = %err,
                                attempts = retry.attempts,
                                "reconcile keeps failing; waiting for the next config change"
                            );
                            pending.clear();
                            retry.reset();
                            retry_at = None;
                        }
                    },
                }
            }
        }
    }

    debug!(channel_id = %ctx.channel_id, "channel worker exited");
}

/// One reconciliation pass over a channel. Partial failures of individual namespaces are
/// reported in the outcome; a transient ledger error anywhere fails the pass after the
/// remaining namespaces were handled.
pub async fn reconcile_channel(ctx: &ChannelContext) -> Result<ReconcileOutcome, ReconcileError> {
    let desired = read_desired(ctx)?;
    ctx.tracked.send_replace(desired.tracked());

    let mut outcome = ReconcileOutcome::default();
    let mut transient: Option<LedgerError> = None;
    let running = ctx.registry.running_on(&ctx.channel_id);

    for namespace in running.keys() {
        if !desired.accepted.contains_key(namespace) {
            stop_service(&ctx.registry, &ctx.channel_id, namespace).await;
            outcome.stopped.push(namespace.clone());
        }
    }

    for (namespace, ns_cfg) in desired.accepted.iter() {
        let restart = match running.get(namespace) {
            None => false,
            Some(current) => {
                let app = match load_app_config(ctx, namespace) {
                    Ok(app) => Some(app),
                    Err(StartupError::Store(e)) => {
                        transient = Some(e);
                        continue;
                    }
                    Err(_) => None,
                };
                let changed_base = current.base_path != ns_cfg.base_path;
                let changed_app = app.map(|a| a.fingerprint) != Some(current.fingerprint.clone());
                if !changed_base && !changed_app {
                    continue;
                }
                info!(
                    channel_id = %ctx.channel_id,
                    namespace = %namespace,
                    changed_base,
                    changed_app,
                    "restarting namespace"
                );
                stop_service(&ctx.registry, &ctx.channel_id, namespace).await;
                true
            }
        };

        match start_service(ctx, ns_cfg).await {
            Ok(()) if restart => outcome.restarted.push(namespace.clone()),
            Ok(()) => outcome.started.push(namespace.clone()),
            Err(err) => {
                warn!(
                    channel_id = %ctx.channel_id,
                    namespace = %namespace,
                    base_path = %ns_cfg.base_path,
                    error = %err,
                    "namespace not started"
                );
                if restart {
                    outcome.stopped.push(namespace.clone());
                }
                match err {
                    StartupError::Store(e) => transient = Some(e),
                    err => outcome.failed.push((namespace.clone(), err.to_string())),
                }
            }
        }
    }

    match transient {
        Some(source) => Err(ReconcileError { source }),
        None => Ok(outcome),
    }
}

fn read_desired(ctx: &ChannelContext) -> Result<DesiredNamespaces, ReconcileError> {
    let key = ctx.peer_key();
    let peer_config = match ctx.config.get(&key) {
        Ok(value) => match value.decode::<PeerConfig>() {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(
                    channel_id = %ctx.channel_id,
                    %key,
                    error = %err,
                    "invalid peer config; serving no namespaces"
                );
                PeerConfig::default()
            }
        },
        Err(ConfigError::Store(source)) => return Err(ReconcileError { source }),
        Err(err) => {
            warn!(
                channel_id = %ctx.channel_id,
                %key,
                error = %err,
                "peer config unavailable; serving no namespaces"
            );
            PeerConfig::default()
        }
    };

    let desired = peer_config.desired();
    for (ns, reason) in desired.rejected.iter() {
        warn!(
            channel_id = %ctx.channel_id,
            namespace = %ns.namespace,
            base_path = %ns.base_path,
            %reason,
            "skipping namespace entry"
        );
    }
    Ok(desired)
}

struct AppSettings {
    config: NamespaceAppConfig,
    fingerprint: String,
}

fn load_app_config(ctx: &ChannelContext, namespace: &str) -> Result<AppSettings, StartupError> {
    let key = ConfigKey::app(GLOBAL_MSP_ID, namespace, NAMESPACE_APP_VERSION);
    let value: ConfigValue = match ctx.config.get(&key) {
        Ok(value) => value,
        Err(ConfigError::NotFound { .. }) => {
            return Err(StartupError::MissingAppConfig {
                namespace: namespace.to_string(),
            });
        }
        Err(ConfigError::Decode { reason, .. }) => {
            return Err(StartupError::InvalidAppConfig {
                namespace: namespace.to_string(),
                reason,
            });
        }
        Err(ConfigError::Store(e)) => return Err(StartupError::Store(e)),
    };
    let config = value
        .decode::<NamespaceAppConfig>()
        .map_err(|e| StartupError::InvalidAppConfig {
            namespace: namespace.to_string(),
            reason: e.to_string(),
        })?;
    Ok(AppSettings {
        config,
        fingerprint: value.fingerprint(),
    })
}

async fn start_service(ctx: &ChannelContext, ns_cfg: &NamespaceConfig) -> Result<(), StartupError> {
    let namespace = ns_cfg.namespace.as_str();
    let app = load_app_config(ctx, namespace)?;

    let protocol = ProtocolVersionSet::new(ctx.config.clone(), namespace);
    let versions = protocol.versions().map_err(|err| match err {
        ProtocolError::Config(ConfigError::Store(e)) => StartupError::Store(e),
        _ => StartupError::NoProtocolVersions {
            namespace: namespace.to_string(),
        },
    })?;
    if versions.is_empty() {
        return Err(StartupError::NoProtocolVersions {
            namespace: namespace.to_string(),
        });
    }

    ctx.registry.insert_starting(
        &ctx.channel_id,
        namespace,
        &ns_cfg.base_path,
        &app.fingerprint,
    );

    let opstore = Arc::new(OperationStore::new(
        ctx.channel_id.clone(),
        namespace,
        ctx.ledger.documents.clone(),
    ));
    let batch = BatchOptions {
        timeout: app.config.batch_writer_timeout.unwrap_or(ctx.batch.timeout),
        ..ctx.batch.clone()
    };
    let writer = Arc::new(spawn_batch_writer(
        BatchContext {
            channel_id: ctx.channel_id.clone(),
            namespace: namespace.to_string(),
            opstore: opstore.clone(),
            protocol: protocol.clone(),
            cas: ctx.cas.clone(),
        },
        batch,
    ));

    let route = NamespaceRoute::new(
        ctx.channel_id.clone(),
        namespace,
        ns_cfg.base_path.clone(),
        opstore,
        protocol,
        writer.clone(),
        ctx.builder.clone(),
    );
    let endpoint = match ctx.rest.register(route).await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            writer.stop().await;
            ctx.registry.remove(&ctx.channel_id, namespace);
            return Err(err.into());
        }
    };

    ctx.registry
        .set_running(&ctx.channel_id, namespace, Arc::new(endpoint), writer);
    info!(
        channel_id = %ctx.channel_id,
        namespace,
        base_path = %ns_cfg.base_path,
        protocol_versions = versions.len(),
        "namespace started"
    );
    Ok(())
}

/// Stopping: endpoint refuses requests, is deregistered, then the writer flushes and exits.
pub(crate) async fn stop_service(registry: &ServiceRegistry, channel_id: &str, namespace: &str) {
    let Some((endpoint, writer)) = registry.begin_stopping(channel_id, namespace) else {
        return;
    };
    if let Some(endpoint) = endpoint {
        endpoint.begin_stopping();
        endpoint.stop().await;
    }
    if let Some(writer) = writer {
        writer.stop().await;
    }
    registry.remove(channel_id, namespace);
    info!(channel_id, namespace, "namespace stopped");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        cas::MemCas,
        config_store::{ConfigFormat, PROTOCOL_COMPONENT_NAME},
        document::MergePatchBuilder,
        ledger::{LedgerProvider, MemChannel, MemLedger},
        lifecycle::ServiceState,
    };

    const CC: &str = "configscc";
    const MSP: &str = "Org1MSP";
    const PEER: &str = "peer1";

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_divisor: 4,
            max_attempts,
        }
    }

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let policy = policy(5);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn retry_jitter_stays_within_a_quarter_and_attempts_run_out() {
        let mut retry = RetryState::new(policy(2), StdRng::seed_from_u64(7));
        let d0 = retry.next_delay().unwrap();
        assert!(d0 >= Duration::from_secs(1) && d0 <= Duration::from_millis(1250));
        let d1 = retry.next_delay().unwrap();
        assert!(d1 >= Duration::from_secs(2) && d1 <= Duration::from_millis(2500));
        assert_eq!(retry.next_delay(), None);
        assert_eq!(retry.attempts, 2);

        retry.reset();
        assert!(retry.next_delay().unwrap() <= Duration::from_millis(1250));
    }

    #[test]
    fn pending_batch_coalesces_events() {
        let mut pending = PendingBatch::default();
        assert!(!pending.has_any());
        let event = |kind| {
            QueuedEvent::Event(ConfigChanged {
                channel_id: "mychannel".to_string(),
                block_number: 1,
                tx_id: "tx".to_string(),
                key: ConfigKey::app(GLOBAL_MSP_ID, "did:a", "1"),
                kind,
                value: None,
            })
        };
        pending.add(event(ConfigChangeKind::App {
            namespace: "did:a".to_string(),
        }));
        pending.add(event(ConfigChangeKind::App {
            namespace: "did:a".to_string(),
        }));
        pending.add(event(ConfigChangeKind::Protocol {
            namespace: "did:b".to_string(),
        }));
        assert!(pending.has_any());
        assert_eq!(pending.apps.len(), 1);
        assert_eq!(pending.protocols.len(), 1);
        assert!(!pending.full);

        pending.add(QueuedEvent::RecomputeAll);
        assert!(pending.full);
        pending.clear();
        assert!(!pending.has_any());
    }

    struct Fixture {
        channel: Arc<MemChannel>,
        ctx: Arc<ChannelContext>,
        tracked: watch::Receiver<BTreeSet<String>>,
    }

    fn fixture() -> Fixture {
        let ledger = MemLedger::new();
        let channel = ledger.create_channel("mychannel");
        let channel_ledger = ledger.channel("mychannel").unwrap();
        let (tracked_tx, tracked) = watch::channel(BTreeSet::new());
        let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let ctx = Arc::new(ChannelContext {
            channel_id: "mychannel".to_string(),
            msp_id: MSP.to_string(),
            peer_id: PEER.to_string(),
            config: ConfigStore::new(channel_ledger.query.clone(), CC),
            ledger: channel_ledger,
            registry: ServiceRegistry::default(),
            rest: RestServer::new(listen),
            cas: Arc::new(MemCas::new()),
            builder: Arc::new(MergePatchBuilder),
            batch: BatchOptions::default(),
            tracked: tracked_tx,
        });
        Fixture {
            channel,
            ctx,
            tracked,
        }
    }

    fn put(channel: &MemChannel, key: ConfigKey, format: ConfigFormat, config: &str) {
        channel.put_state(
            CC,
            &key.marshal(),
            ConfigValue::new("tx", format, config).to_bytes().unwrap(),
        );
    }

    fn put_peer(channel: &MemChannel, namespaces: &[(&str, &str)]) {
        let entries: Vec<_> = namespaces
            .iter()
            .map(|(ns, base)| json!({"Namespace": ns, "BasePath": base}))
            .collect();
        put(
            channel,
            ConfigKey::peer(MSP, PEER, SIDETREE_APP_NAME, SIDETREE_APP_VERSION),
            ConfigFormat::Json,
            &json!({ "Namespaces": entries }).to_string(),
        );
    }

    fn put_namespace(channel: &MemChannel, namespace: &str, timeout: &str) {
        put(
            channel,
            ConfigKey::app(GLOBAL_MSP_ID, namespace, NAMESPACE_APP_VERSION),
            ConfigFormat::Yaml,
            &format!("batchWriterTimeout: {timeout}"),
        );
        put(
            channel,
            ConfigKey::component(
                GLOBAL_MSP_ID,
                namespace,
                NAMESPACE_APP_VERSION,
                PROTOCOL_COMPONENT_NAME,
                "0.5",
            ),
            ConfigFormat::Json,
            &json!({
                "startingBlockchainTime": 0,
                "hashAlgorithmInMultihashCode": 18,
                "maxOperationByteSize": 2000,
                "maxOperationsPerBatch": 10,
            })
            .to_string(),
        );
    }

    fn namespaces(ctx: &ChannelContext) -> Vec<String> {
        ctx.registry.running_on(&ctx.channel_id).into_keys().collect()
    }

    #[tokio::test]
    async fn missing_peer_config_serves_nothing() {
        let f = fixture();
        let outcome = reconcile_channel(&f.ctx).await.unwrap();
        assert!(outcome.is_noop());
        assert!(f.tracked.borrow().is_empty());
        assert_eq!(f.ctx.rest.local_addr().await, None);
    }

    #[tokio::test]
    async fn starts_stops_and_restarts() {
        let f = fixture();
        put_namespace(&f.channel, "did:a", "1s");
        put_namespace(&f.channel, "did:b", "1s");
        put_peer(&f.channel, &[("did:a", "/a"), ("did:b", "/b")]);

        let outcome = reconcile_channel(&f.ctx).await.unwrap();
        assert_eq!(outcome.started, vec!["did:a".to_string(), "did:b".to_string()]);
        assert_eq!(namespaces(&f.ctx), vec!["did:a".to_string(), "did:b".to_string()]);
        assert_eq!(
            *f.tracked.borrow(),
            BTreeSet::from(["did:a".to_string(), "did:b".to_string()])
        );

        // idempotent
        assert!(reconcile_channel(&f.ctx).await.unwrap().is_noop());

        // app config change restarts only that namespace
        put_namespace(&f.channel, "did:a", "2s");
        let outcome = reconcile_channel(&f.ctx).await.unwrap();
        assert_eq!(outcome.restarted, vec!["did:a".to_string()]);
        assert!(outcome.started.is_empty());

        // base path change restarts
        put_peer(&f.channel, &[("did:a", "/a2"), ("did:b", "/b")]);
        let outcome = reconcile_channel(&f.ctx).await.unwrap();
        assert_eq!(outcome.restarted, vec!["did:a".to_string()]);
        let mut routes = f.ctx.rest.routes();
        routes.sort();
        assert_eq!(
            routes,
            vec![
                ("/a2".to_string(), "did:a".to_string()),
                ("/b".to_string(), "did:b".to_string())
            ]
        );

        let b_before: Vec<_> = f
            .ctx
            .registry
            .status()
            .into_iter()
            .filter(|s| s.namespace == "did:b")
            .collect();
        put_peer(&f.channel, &[("did:b", "/b")]);
        let outcome = reconcile_channel(&f.ctx).await.unwrap();
        assert_eq!(outcome.stopped, vec!["did:a".to_string()]);
        assert!(outcome.restarted.is_empty());
        assert!(outcome.started.is_empty());
        assert_eq!(namespaces(&f.ctx), vec!["did:b".to_string()]);
        assert_eq!(f.ctx.registry.status(), b_before);

        put(
            &f.channel,
            ConfigKey::peer(MSP, PEER, SIDETREE_APP_NAME, SIDETREE_APP_VERSION),
            ConfigFormat::Json,
            "{}",
        );
        reconcile_channel(&f.ctx).await.unwrap();
        assert!(namespaces(&f.ctx).is_empty());
        assert_eq!(f.ctx.rest.local_addr().await, None);
    }

    #[tokio::test]
    async fn protocol_change_does_not_restart() {
        let f = fixture();
        put_namespace(&f.channel, "did:a", "1s");
        put_peer(&f.channel, &[("did:a", "/a")]);
        reconcile_channel(&f.ctx).await.unwrap();

        put(
            &f.channel,
            ConfigKey::component(
                GLOBAL_MSP_ID,
                "did:a",
                NAMESPACE_APP_VERSION,
                PROTOCOL_COMPONENT_NAME,
                "1.0",
            ),
            ConfigFormat::Json,
            &json!({
                "startingBlockchainTime": 100,
                "hashAlgorithmInMultihashCode": 18,
                "maxOperationByteSize": 500,
                "maxOperationsPerBatch": 5,
            })
            .to_string(),
        );
        assert!(reconcile_channel(&f.ctx).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn broken_namespace_does_not_block_siblings() {
        let f = fixture();
        put_namespace(&f.channel, "did:b", "1s");
        put(
            &f.channel,
            ConfigKey::app(GLOBAL_MSP_ID, "did:a", NAMESPACE_APP_VERSION),
            ConfigFormat::Json,
            "{not json",
        );
        put(
            &f.channel,
            ConfigKey::app(GLOBAL_MSP_ID, "did:c", NAMESPACE_APP_VERSION),
            ConfigFormat::Json,
            "{}",
        );
        put_peer(
            &f.channel,
            &[("did:a", "/a"), ("did:b", "/b"), ("did:c", "/c"), ("did:d", "/d")],
        );

        let outcome = reconcile_channel(&f.ctx).await.unwrap();
        assert_eq!(outcome.started, vec!["did:b".to_string()]);
        let failed: Vec<&str> = outcome.failed.iter().map(|(ns, _)| ns.as_str()).collect();
        assert_eq!(failed, vec!["did:a", "did:c", "did:d"]);
        assert!(outcome.failed[1].1.contains("protocol"));
        assert!(outcome.failed[2].1.contains("not found"));
        assert_eq!(f.tracked.borrow().len(), 4);
    }

    #[tokio::test]
    async fn unavailable_ledger_fails_the_pass() {
        let f = fixture();
        f.channel.set_unavailable(true);
        let err = reconcile_channel(&f.ctx).await.unwrap_err();
        assert!(matches!(err.source, LedgerError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn worker_reconciles_on_start_and_on_events() {
        let f = fixture();
        put_namespace(&f.channel, "did:a", "1s");
        put_peer(&f.channel, &[("did:a", "/a")]);

        let queue = Arc::new(EventQueue::new(8));
        let worker = spawn_channel_worker(
            f.ctx.clone(),
            queue.clone(),
            WorkerOptions::new(Duration::from_millis(5), 5),
        );

        let wait_for = |expected: Vec<String>| {
            let ctx = f.ctx.clone();
            async move {
                tokio::time::timeout(Duration::from_secs(2), async {
                    loop {
                        let running: Vec<String> = ctx
                            .registry
                            .status()
                            .into_iter()
                            .filter(|s| s.state == ServiceState::Running)
                            .map(|s| s.namespace)
                            .collect();
                        if running == expected {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })
                .await
                .unwrap();
            }
        };
        wait_for(vec!["did:a".to_string()]).await;

        put_peer(&f.channel, &[]);
        queue.request_recompute();
        wait_for(vec![]).await;

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn worker_retries_transient_failures() {
        let f = fixture();
        put_namespace(&f.channel, "did:a", "1s");
        put_peer(&f.channel, &[("did:a", "/a")]);
        f.channel.set_unavailable(true);

        let queue = Arc::new(EventQueue::new(8));
        let worker = spawn_channel_worker(
            f.ctx.clone(),
            queue.clone(),
            WorkerOptions::new(Duration::ZERO, 10)
                .with_retry_delays(Duration::from_millis(10), Duration::from_millis(20)),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(namespaces(&f.ctx).is_empty());

        f.channel.set_unavailable(false);
        tokio::time::timeout(Duration::from_secs(2), async {
            while namespaces(&f.ctx).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        worker.shutdown().await;
    }
}
