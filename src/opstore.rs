//! Per-namespace operation store on one channel.
//!
//! Operations are append-only. Each one is stored under
//! `<namespace>:<suffix>\0<sha256 of the operation bytes>`, so rewriting an identical operation
//! is idempotent and enumeration order is a function of content only.

use std::sync::Arc;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use tracing::debug;

use crate::ledger::{KvStore, LedgerError};

pub const NAMESPACE_DELIMITER: &str = ":";
const KEY_DELIMITER: char = '\u{0}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Recover,
    #[serde(alias = "delete")]
    Deactivate,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Recover => "recover",
            Self::Deactivate => "deactivate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Fully qualified id: `<namespace>:<unique_suffix>`.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub unique_suffix: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default)]
    pub transaction_time: u64,
    #[serde(default)]
    pub transaction_number: u64,
    #[serde(default)]
    pub payload: Value,
}

impl Operation {
    pub fn new(op_type: OperationType, unique_suffix: impl Into<String>, payload: Value) -> Self {
        Self {
            id: String::new(),
            unique_suffix: unique_suffix.into(),
            op_type,
            transaction_time: 0,
            transaction_number: 0,
            payload,
        }
    }

    pub fn with_ledger_position(mut self, transaction_time: u64, transaction_number: u64) -> Self {
        self.transaction_time = transaction_time;
        self.transaction_number = transaction_number;
        self
    }

    /// Fills in the suffix (derived from content for creates) and the namespaced id.
    pub fn normalize(&mut self, namespace: &str) -> Result<(), OpStoreError> {
        if self.unique_suffix.is_empty() {
            if self.op_type != OperationType::Create {
                return Err(OpStoreError::Invalid {
                    reason: format!(
                        "{} operation without a document suffix",
                        self.op_type.as_str()
                    ),
                });
            }
            self.unique_suffix = derive_unique_suffix(&self.payload);
        }
        if self.unique_suffix.contains(KEY_DELIMITER) {
            return Err(OpStoreError::Invalid {
                reason: "document suffix contains reserved characters".to_string(),
            });
        }
        self.id = document_id(namespace, &self.unique_suffix);
        Ok(())
    }
}

pub fn document_id(namespace: &str, suffix: &str) -> String {
    format!("{namespace}{NAMESPACE_DELIMITER}{suffix}")
}

/// base64url (no padding) of the SHA-256 of the canonical payload bytes.
pub fn derive_unique_suffix(payload: &Value) -> String {
    // serde_json maps are ordered, so serialization is canonical for a given value.
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

#[derive(Debug)]
pub enum OpStoreError {
    NotFound { suffix: String },
    Decode { key: String, reason: String },
    Invalid { reason: String },
    Store(LedgerError),
}

impl OpStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl std::fmt::Display for OpStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { suffix } => write!(f, "operations not found for suffix {suffix}"),
            Self::Decode { key, reason } => write!(f, "invalid stored operation {key:?}: {reason}"),
            Self::Invalid { reason } => write!(f, "invalid operation: {reason}"),
            Self::Store(e) => write!(f, "operation store: {e}"),
        }
    }
}

impl std::error::Error for OpStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LedgerError> for OpStoreError {
    fn from(value: LedgerError) -> Self {
        Self::Store(value)
    }
}

pub struct OperationStore {
    channel_id: String,
    namespace: String,
    kv: Arc<dyn KvStore>,
}

impl OperationStore {
    pub fn new(
        channel_id: impl Into<String>,
        namespace: impl Into<String>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            namespace: namespace.into(),
            kv,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Appends `operations` in a single backing-store write. Nothing already stored is touched.
    pub fn put(&self, operations: &[Operation]) -> Result<(), OpStoreError> {
        let mut entries = Vec::with_capacity(operations.len());
        for op in operations {
            let mut op = op.clone();
            op.normalize(&self.namespace)?;
            let bytes = serde_json::to_vec(&op).map_err(|e| OpStoreError::Invalid {
                reason: e.to_string(),
            })?;
            let key = format!(
                "{}{}",
                self.suffix_prefix(&op.unique_suffix),
                hex::encode(Sha256::digest(&bytes))
            );
            entries.push((key, bytes));
        }
        if entries.is_empty() {
            return Ok(());
        }

        let count = entries.len();
        self.kv.put(entries)?;
        debug!(
            channel_id = %self.channel_id,
            namespace = %self.namespace,
            count,
            "operations stored"
        );
        Ok(())
    }

    /// All operations of a document in chronological order. A single undecodable record fails
    /// the whole read.
    pub fn get(&self, suffix: &str) -> Result<Vec<Operation>, OpStoreError> {
        let records = self.kv.scan_prefix(&self.suffix_prefix(suffix))?;
        if records.is_empty() {
            return Err(OpStoreError::NotFound {
                suffix: suffix.to_string(),
            });
        }
        let ops = decode_operations(records)?;
        Ok(sort_chronologically(ops))
    }

    /// Highest (transaction time, transaction number) stored for the namespace. Records that do
    /// not decode are skipped.
    pub fn last_position(&self) -> Result<Option<(u64, u64)>, OpStoreError> {
        let prefix = format!("{}{NAMESPACE_DELIMITER}", self.namespace);
        let records = self.kv.scan_prefix(&prefix)?;
        Ok(records
            .iter()
            .filter_map(|(_, bytes)| serde_json::from_slice::<LedgerPosition>(bytes).ok())
            .map(|p| (p.transaction_time, p.transaction_number))
            .max())
    }

    fn suffix_prefix(&self, suffix: &str) -> String {
        format!("{}{KEY_DELIMITER}", document_id(&self.namespace, suffix))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerPosition {
    #[serde(default)]
    transaction_time: u64,
    #[serde(default)]
    transaction_number: u64,
}

fn decode_operations(records: Vec<(String, Vec<u8>)>) -> Result<Vec<Operation>, OpStoreError> {
    records
        .into_iter()
        .map(|(key, bytes)| {
            serde_json::from_slice::<Operation>(&bytes).map_err(|e| OpStoreError::Decode {
                key,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Orders by (transaction time, transaction number). The sort is stable, so ties keep the
/// backing store's enumeration order.
pub fn sort_chronologically(mut operations: Vec<Operation>) -> Vec<Operation> {
    operations.sort_by_key(|op| (op.transaction_time, op.transaction_number));
    operations
}
