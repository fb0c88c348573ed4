//! Protocol parameter versions per namespace.
//!
//! Versions are component records (`protocol` component) of the namespace application. Each
//! one declares the ledger time from which it applies. Lookups re-read the ledger every time,
//! so newly committed versions take effect at their declared time without restarting anything.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config_store::{
    ConfigError, ConfigStore, GLOBAL_MSP_ID, NAMESPACE_APP_VERSION, PROTOCOL_COMPONENT_NAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolParameters {
    pub starting_blockchain_time: u64,
    pub hash_algorithm_in_multihash_code: u64,
    pub max_operation_byte_size: u64,
    pub max_operations_per_batch: u64,
}

impl ProtocolParameters {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_operation_byte_size == 0 {
            return Err("maxOperationByteSize must be > 0".to_string());
        }
        if self.max_operations_per_batch == 0 {
            return Err("maxOperationsPerBatch must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Component version of the record (e.g. `0.5`).
    pub version: String,
    pub tx_id: String,
    pub parameters: ProtocolParameters,
}

#[derive(Debug)]
pub enum ProtocolError {
    NoApplicableVersion { namespace: String, ledger_time: u64 },
    Config(ConfigError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoApplicableVersion {
                namespace,
                ledger_time,
            } => write!(
                f,
                "no protocol version applicable for {namespace} at ledger time {ledger_time}"
            ),
            Self::Config(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::NoApplicableVersion { .. } => None,
        }
    }
}

impl From<ConfigError> for ProtocolError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

/// Registry view over every namespace on one channel.
#[derive(Clone)]
pub struct ProtocolRegistry {
    store: ConfigStore,
    app_version: String,
}

impl ProtocolRegistry {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            app_version: NAMESPACE_APP_VERSION.to_string(),
        }
    }

    /// Valid versions of `namespace`, ordered by starting time. Malformed records are skipped.
    pub fn versions_for(&self, namespace: &str) -> Result<Vec<ProtocolVersion>, ProtocolError> {
        let records = self.store.query_component_versions(
            GLOBAL_MSP_ID,
            namespace,
            &self.app_version,
            PROTOCOL_COMPONENT_NAME,
        )?;

        let mut versions = Vec::with_capacity(records.len());
        for (key, value) in records {
            let version = key.component_version.clone().unwrap_or_default();
            let parameters = match value.decode::<ProtocolParameters>() {
                Ok(p) => p,
                Err(err) => {
                    warn!(namespace, %key, error = %err, "skipping malformed protocol version");
                    continue;
                }
            };
            if let Err(reason) = parameters.validate() {
                warn!(namespace, %key, %reason, "skipping invalid protocol version");
                continue;
            }
            versions.push(ProtocolVersion {
                version,
                tx_id: value.tx_id,
                parameters,
            });
        }

        Ok(order_versions(namespace, versions))
    }

    pub fn parameters_at(
        &self,
        namespace: &str,
        ledger_time: u64,
    ) -> Result<ProtocolParameters, ProtocolError> {
        let versions = self.versions_for(namespace)?;
        select_at(&versions, ledger_time)
            .map(|v| v.parameters)
            .ok_or_else(|| ProtocolError::NoApplicableVersion {
                namespace: namespace.to_string(),
                ledger_time,
            })
    }

    pub fn for_namespace(&self, namespace: impl Into<String>) -> ProtocolVersionSet {
        ProtocolVersionSet {
            registry: self.clone(),
            namespace: namespace.into(),
        }
    }
}

/// Protocol versions of one namespace, bound at construction.
#[derive(Clone)]
pub struct ProtocolVersionSet {
    registry: ProtocolRegistry,
    namespace: String,
}

impl ProtocolVersionSet {
    pub fn new(store: ConfigStore, namespace: impl Into<String>) -> Self {
        ProtocolRegistry::new(store).for_namespace(namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn versions(&self) -> Result<Vec<ProtocolVersion>, ProtocolError> {
        self.registry.versions_for(&self.namespace)
    }

    pub fn parameters_at(&self, ledger_time: u64) -> Result<ProtocolParameters, ProtocolError> {
        self.registry.parameters_at(&self.namespace, ledger_time)
    }

    /// Current ledger height of the channel the set reads from.
    pub fn ledger_time(&self) -> u64 {
        self.registry.store.height()
    }

    /// Parameters in force at the ledger's current height.
    pub fn current(&self) -> Result<ProtocolParameters, ProtocolError> {
        self.parameters_at(self.ledger_time())
    }
}

/// Latest version whose starting time is at or before `ledger_time`.
pub fn select_at(versions: &[ProtocolVersion], ledger_time: u64) -> Option<&ProtocolVersion> {
    versions
        .iter()
        .rev()
        .find(|v| v.parameters.starting_blockchain_time <= ledger_time)
}

/// Sorts by starting time. When two versions claim the same starting time the higher
/// component version wins and the other is dropped.
fn order_versions(namespace: &str, mut versions: Vec<ProtocolVersion>) -> Vec<ProtocolVersion> {
    versions.sort_by(|a, b| {
        a.parameters
            .starting_blockchain_time
            .cmp(&b.parameters.starting_blockchain_time)
            .then_with(|| compare_versions(&a.version, &b.version))
    });

    let mut out: Vec<ProtocolVersion> = Vec::with_capacity(versions.len());
    for v in versions {
        if let Some(last) = out.last_mut()
            && last.parameters.starting_blockchain_time == v.parameters.starting_blockchain_time
        {
            warn!(
                namespace,
                dropped = %last.version,
                kept = %v.version,
                starting_blockchain_time = v.parameters.starting_blockchain_time,
                "protocol versions share a starting time"
            );
            *last = v;
            continue;
        }
        out.push(v);
    }
    out
}

/// Compares dotted versions segment by segment (`0.10` > `0.9`). Numeric segments sort before
/// non-numeric ones, which compare as text. Versions that only differ in spelling (`01` and `1`)
/// fall back to comparing the raw strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    a.split('.')
        .map(VersionSegment::parse)
        .cmp(b.split('.').map(VersionSegment::parse))
        .then_with(|| a.cmp(b))
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum VersionSegment<'a> {
    Number(u64),
    Text(&'a str),
}

impl<'a> VersionSegment<'a> {
    fn parse(segment: &'a str) -> Self {
        segment
            .parse()
            .map(Self::Number)
            .unwrap_or(Self::Text(segment))
    }
}
