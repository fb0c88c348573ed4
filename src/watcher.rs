//! Turns committed config-chaincode writes on one channel into [`ConfigChanged`] events.
//!
//! The observer runs on the ledger's commit path: it only classifies writes and pushes onto
//! the channel's [`EventQueue`], it never awaits and never touches the ledger.

use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config_store::{
        ConfigKey, ConfigValue, GLOBAL_MSP_ID, PROTOCOL_COMPONENT_NAME, SIDETREE_APP_NAME,
        SIDETREE_APP_VERSION, config_key_prefix,
    },
    ledger::{Block, BlockObserver, BlockPublisher, ObserverId},
    queue::EventQueue,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigChangeKind {
    /// This peer's namespace list.
    Peer,
    /// Application config of a tracked namespace.
    App { namespace: String },
    /// A protocol version of a tracked namespace.
    Protocol { namespace: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChanged {
    pub channel_id: String,
    pub block_number: u64,
    pub tx_id: String,
    pub key: ConfigKey,
    pub kind: ConfigChangeKind,
    /// `None` for deletes and for values that are not a config envelope.
    pub value: Option<ConfigValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Unjoined,
    Watching,
    Stopped,
}

/// Identity and chaincode a watcher filters on.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub msp_id: String,
    pub peer_id: String,
    pub config_chaincode: String,
}

/// The block observer registered with the publisher.
pub struct BlockFilter {
    channel_id: String,
    target: WatchTarget,
    tracked: watch::Receiver<BTreeSet<String>>,
    queue: Arc<EventQueue<ConfigChanged>>,
    active: AtomicBool,
}

impl BlockFilter {
    pub fn new(
        channel_id: impl Into<String>,
        target: WatchTarget,
        tracked: watch::Receiver<BTreeSet<String>>,
        queue: Arc<EventQueue<ConfigChanged>>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            target,
            tracked,
            queue,
            active: AtomicBool::new(true),
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Relevant config writes of `block`, in block order.
    pub fn events_for(&self, block: &Block) -> Vec<ConfigChanged> {
        let prefix = config_key_prefix();
        let tracked = self.tracked.borrow().clone();
        let mut events = Vec::new();
        for tx in block.transactions.iter() {
            if !tx.valid {
                continue;
            }
            for action in tx
                .actions
                .iter()
                .filter(|a| a.chaincode == self.target.config_chaincode)
            {
                for write in action.writes.iter() {
                    if !write.key.starts_with(&prefix) {
                        continue;
                    }
                    let Some(key) = ConfigKey::parse(&write.key) else {
                        debug!(key = ?write.key, "ignoring malformed config key");
                        continue;
                    };
                    let Some(kind) = self.classify(&key, &tracked) else {
                        continue;
                    };
                    let value = match write.value.as_deref().map(ConfigValue::from_bytes) {
                        None => None,
                        Some(Ok(value)) => Some(value),
                        Some(Err(err)) => {
                            warn!(
                                channel_id = %self.channel_id,
                                %key,
                                error = %err,
                                "config write is not a valid envelope"
                            );
                            None
                        }
                    };
                    events.push(ConfigChanged {
                        channel_id: self.channel_id.clone(),
                        block_number: block.number,
                        tx_id: tx.tx_id.clone(),
                        key,
                        kind,
                        value,
                    });
                }
            }
        }
        events
    }

    fn classify(&self, key: &ConfigKey, tracked: &BTreeSet<String>) -> Option<ConfigChangeKind> {
        if key.msp_id == self.target.msp_id
            && key.peer_id.as_deref() == Some(self.target.peer_id.as_str())
            && key.app_name == SIDETREE_APP_NAME
            && key.app_version == SIDETREE_APP_VERSION
            && !key.is_component()
        {
            return Some(ConfigChangeKind::Peer);
        }
        if key.msp_id != GLOBAL_MSP_ID || key.peer_id.is_some() || !tracked.contains(&key.app_name)
        {
            return None;
        }
        let namespace = key.app_name.clone();
        match key.component_name.as_deref() {
            None => Some(ConfigChangeKind::App { namespace }),
            Some(PROTOCOL_COMPONENT_NAME) => Some(ConfigChangeKind::Protocol { namespace }),
            Some(_) => None,
        }
    }
}

impl BlockObserver for BlockFilter {
    fn on_block(&self, block: &Block) {
        if !self.active.load(Ordering::SeqCst) || block.channel_id != self.channel_id {
            return;
        }
        for event in self.events_for(block) {
            debug!(
                channel_id = %event.channel_id,
                block_number = event.block_number,
                key = %event.key,
                kind = ?event.kind,
                "config changed"
            );
            if !self.queue.push(event) {
                warn!(
                    channel_id = %self.channel_id,
                    capacity = self.queue.capacity(),
                    "event queue full; superseding oldest event with full recompute"
                );
            }
        }
    }
}

struct Registration {
    id: ObserverId,
    filter: Arc<BlockFilter>,
}

/// Lifecycle of one channel's block observer: `Unjoined -> Watching -> Stopped`.
pub struct ChannelConfigWatcher {
    channel_id: String,
    publisher: Arc<dyn BlockPublisher>,
    filter: Arc<BlockFilter>,
    state: Mutex<(WatcherState, Option<Registration>)>,
}

impl ChannelConfigWatcher {
    pub fn new(
        channel_id: impl Into<String>,
        publisher: Arc<dyn BlockPublisher>,
        target: WatchTarget,
        tracked: watch::Receiver<BTreeSet<String>>,
        queue: Arc<EventQueue<ConfigChanged>>,
    ) -> Self {
        let channel_id = channel_id.into();
        let filter = Arc::new(BlockFilter::new(channel_id.clone(), target, tracked, queue));
        Self {
            channel_id,
            publisher,
            filter,
            state: Mutex::new((WatcherState::Unjoined, None)),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn state(&self) -> WatcherState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    /// Registers the observer. No-op unless `Unjoined`.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.0 != WatcherState::Unjoined {
            return;
        }
        let observer: Arc<dyn BlockObserver> = self.filter.clone();
        let id = self.publisher.register(observer);
        *state = (
            WatcherState::Watching,
            Some(Registration {
                id,
                filter: self.filter.clone(),
            }),
        );
        info!(channel_id = %self.channel_id, observer_id = id.0, "config watcher started");
    }

    /// Deregisters the observer; blocks committed afterwards are dropped.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reg) = state.1.take() {
            reg.filter.deactivate();
            self.publisher.deregister(reg.id);
            info!(channel_id = %self.channel_id, "config watcher stopped");
        }
        state.0 = WatcherState::Stopped;
    }
}

impl Drop for ChannelConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
