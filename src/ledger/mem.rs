use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tracing::debug;

use super::{
    Block, BlockObserver, BlockPublisher, ChaincodeAction, ChannelLedger, KvStore, KvWrite,
    LedgerError, LedgerProvider, ObserverId, StateQuery, Transaction,
};

/// In-memory multi-channel ledger.
#[derive(Default)]
pub struct MemLedger {
    channels: RwLock<BTreeMap<String, Arc<MemChannel>>>,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel, creating it on first use.
    pub fn create_channel(&self, channel_id: &str) -> Arc<MemChannel> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(MemChannel::new(channel_id)))
            .clone()
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<Arc<MemChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .cloned()
    }
}

impl LedgerProvider for MemLedger {
    fn channel(&self, channel_id: &str) -> Option<ChannelLedger> {
        let channel = self.get_channel(channel_id)?;
        Some(ChannelLedger {
            channel_id: channel_id.to_string(),
            query: channel.clone(),
            blocks: channel.clone(),
            documents: channel,
        })
    }
}

pub struct MemChannel {
    channel_id: String,
    state: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    documents: RwLock<BTreeMap<String, Vec<u8>>>,
    height: AtomicU64,
    observers: Mutex<BTreeMap<ObserverId, Arc<dyn BlockObserver>>>,
    next_observer_id: AtomicU64,
    commit_lock: Mutex<()>,
    unavailable: AtomicBool,
    document_writes_fail: AtomicBool,
}

impl MemChannel {
    pub fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            state: RwLock::new(BTreeMap::new()),
            documents: RwLock::new(BTreeMap::new()),
            height: AtomicU64::new(0),
            observers: Mutex::new(BTreeMap::new()),
            next_observer_id: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
            unavailable: AtomicBool::new(false),
            document_writes_fail: AtomicBool::new(false),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Writes state without producing a block (genesis/seed data).
    pub fn put_state(&self, chaincode: &str, key: &str, value: impl Into<Vec<u8>>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .entry(chaincode.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// Makes every state query fail with `LedgerError::Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_document_writes_fail(&self, fail: bool) {
        self.document_writes_fail.store(fail, Ordering::SeqCst);
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Applies the writes of every valid transaction, advances the height and notifies observers
    /// in registration order. Commits are serialized so observers see blocks in commit order.
    pub fn commit(&self, block: &Block) {
        let _commit = self
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            for tx in block.transactions.iter().filter(|tx| tx.valid) {
                for action in tx.actions.iter() {
                    let entries = state.entry(action.chaincode.clone()).or_default();
                    for write in action.writes.iter() {
                        match &write.value {
                            Some(value) => {
                                entries.insert(write.key.clone(), value.clone());
                            }
                            None => {
                                entries.remove(&write.key);
                            }
                        }
                    }
                }
            }
        }
        self.height.fetch_max(block.number + 1, Ordering::SeqCst);

        let observers: Vec<Arc<dyn BlockObserver>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        debug!(
            channel_id = %self.channel_id,
            block_number = block.number,
            observers = observers.len(),
            "block committed"
        );
        for observer in observers {
            observer.on_block(block);
        }
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable {
                channel_id: self.channel_id.clone(),
            });
        }
        Ok(())
    }
}

impl StateQuery for MemChannel {
    fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    fn get_state(&self, chaincode: &str, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        self.check_available()?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.get(chaincode).and_then(|m| m.get(key)).cloned())
    }

    fn scan_prefix(
        &self,
        chaincode: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, LedgerError> {
        self.check_available()?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = state.get(chaincode) else {
            return Ok(Vec::new());
        };
        Ok(scan(entries, prefix))
    }
}

impl BlockPublisher for MemChannel {
    fn register(&self, observer: Arc<dyn BlockObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::SeqCst));
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, observer);
        id
    }

    fn deregister(&self, id: ObserverId) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

impl KvStore for MemChannel {
    fn put(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), LedgerError> {
        if self.document_writes_fail.load(Ordering::SeqCst) {
            return Err(LedgerError::Query {
                reason: "document collection rejected write".to_string(),
            });
        }
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in entries {
            documents.insert(key, value);
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, LedgerError> {
        self.check_available()?;
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(scan(&documents, prefix))
    }
}

fn scan(entries: &BTreeMap<String, Vec<u8>>, prefix: &str) -> Vec<(String, Vec<u8>)> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Fluent builder for committed blocks.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    block: Block,
}

impl BlockBuilder {
    pub fn new(channel_id: &str, number: u64) -> Self {
        Self {
            block: Block {
                channel_id: channel_id.to_string(),
                number,
                transactions: Vec::new(),
            },
        }
    }

    pub fn transaction(&mut self, tx_id: &str, valid: bool) -> TransactionBuilder<'_> {
        self.block.transactions.push(Transaction {
            tx_id: tx_id.to_string(),
            valid,
            actions: Vec::new(),
        });
        let idx = self.block.transactions.len() - 1;
        TransactionBuilder {
            tx: &mut self.block.transactions[idx],
        }
    }

    pub fn build(self) -> Block {
        self.block
    }
}

pub struct TransactionBuilder<'a> {
    tx: &'a mut Transaction,
}

impl TransactionBuilder<'_> {
    pub fn write(self, chaincode: &str, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.push(chaincode, key, Some(value.into()))
    }

    pub fn delete(self, chaincode: &str, key: &str) -> Self {
        self.push(chaincode, key, None)
    }

    fn push(self, chaincode: &str, key: &str, value: Option<Vec<u8>>) -> Self {
        let write = KvWrite {
            key: key.to_string(),
            value,
        };
        match self.tx.actions.iter_mut().find(|a| a.chaincode == chaincode) {
            Some(action) => action.writes.push(write),
            None => self.tx.actions.push(ChaincodeAction {
                chaincode: chaincode.to_string(),
                writes: vec![write],
            }),
        }
        self
    }
}
