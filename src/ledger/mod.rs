//! Ledger collaborator boundaries.
//!
//! The peer never talks to the ledger directly. It consumes three capabilities per channel:
//! - `StateQuery`: read committed chaincode state at the current height;
//! - `BlockPublisher`: observe committed blocks in commit order;
//! - `KvStore`: the off-chain document collection backing the operation store.
//!
//! `mem` provides an in-memory implementation of all three, used by tests and the demo binary.

pub mod mem;

use std::sync::Arc;

pub use mem::{BlockBuilder, MemChannel, MemLedger};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    Unavailable { channel_id: String },
    Query { reason: String },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { channel_id } => write!(f, "ledger unavailable: {channel_id}"),
            Self::Query { reason } => write!(f, "ledger query failed: {reason}"),
        }
    }
}

impl std::error::Error for LedgerError {}

/// A single key write inside a chaincode action. `value == None` is a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvWrite {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeAction {
    pub chaincode: String,
    pub writes: Vec<KvWrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub tx_id: String,
    pub valid: bool,
    pub actions: Vec<ChaincodeAction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub channel_id: String,
    pub number: u64,
    pub transactions: Vec<Transaction>,
}

/// Read access to committed state on one channel.
pub trait StateQuery: Send + Sync + 'static {
    /// Current commit height; also used as the ledger time for protocol lookups.
    fn height(&self) -> u64;

    fn get_state(&self, chaincode: &str, key: &str) -> Result<Option<Vec<u8>>, LedgerError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn scan_prefix(
        &self,
        chaincode: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, LedgerError>;
}

/// Invoked once per committed block, on the commit path. Implementations must not block.
pub trait BlockObserver: Send + Sync + 'static {
    fn on_block(&self, block: &Block);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(pub u64);

pub trait BlockPublisher: Send + Sync + 'static {
    fn register(&self, observer: Arc<dyn BlockObserver>) -> ObserverId;

    fn deregister(&self, id: ObserverId);
}

/// Off-chain key/value collection used for document operations.
pub trait KvStore: Send + Sync + 'static {
    fn put(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), LedgerError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, LedgerError>;
}

/// Everything the peer needs from one joined channel.
#[derive(Clone)]
pub struct ChannelLedger {
    pub channel_id: String,
    pub query: Arc<dyn StateQuery>,
    pub blocks: Arc<dyn BlockPublisher>,
    pub documents: Arc<dyn KvStore>,
}

pub trait LedgerProvider: Send + Sync + 'static {
    fn channel(&self, channel_id: &str) -> Option<ChannelLedger>;
}
