//! Typed access to versioned configuration records committed by the config chaincode.
//!
//! Records are addressed by [`ConfigKey`], serialized into the ledger's composite-key form.
//! Every read goes to the ledger at its current height; nothing is cached here.

use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest as _, Sha256};
use tracing::warn;

use crate::ledger::{LedgerError, StateQuery};

/// Organization used for consortium-wide (application and component) records.
pub const GLOBAL_MSP_ID: &str = "general";
/// Object type of every config composite key.
pub const CONFIG_OBJECT_TYPE: &str = "cfgmgmt";
/// App name and version of the peer-level record listing the namespaces a peer serves.
pub const SIDETREE_APP_NAME: &str = "sidetree";
pub const SIDETREE_APP_VERSION: &str = "1";
/// App version under which namespace application and protocol records are written.
pub const NAMESPACE_APP_VERSION: &str = "1";
pub const PROTOCOL_COMPONENT_NAME: &str = "protocol";
pub const DEFAULT_CONFIG_CHAINCODE: &str = "configscc";

const KEY_DELIMITER: char = '\u{0}';

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigKey {
    pub msp_id: String,
    pub peer_id: Option<String>,
    pub app_name: String,
    pub app_version: String,
    pub component_name: Option<String>,
    pub component_version: Option<String>,
}

impl ConfigKey {
    pub fn peer(msp_id: &str, peer_id: &str, app_name: &str, app_version: &str) -> Self {
        Self {
            msp_id: msp_id.to_string(),
            peer_id: Some(peer_id.to_string()),
            app_name: app_name.to_string(),
            app_version: app_version.to_string(),
            component_name: None,
            component_version: None,
        }
    }

    pub fn app(msp_id: &str, app_name: &str, app_version: &str) -> Self {
        Self {
            msp_id: msp_id.to_string(),
            peer_id: None,
            app_name: app_name.to_string(),
            app_version: app_version.to_string(),
            component_name: None,
            component_version: None,
        }
    }

    pub fn component(
        msp_id: &str,
        app_name: &str,
        app_version: &str,
        component_name: &str,
        component_version: &str,
    ) -> Self {
        Self {
            msp_id: msp_id.to_string(),
            peer_id: None,
            app_name: app_name.to_string(),
            app_version: app_version.to_string(),
            component_name: Some(component_name.to_string()),
            component_version: Some(component_version.to_string()),
        }
    }

    pub fn is_component(&self) -> bool {
        self.component_name.is_some()
    }

    /// Composite-key form: `\0cfgmgmt\0msp\0peer\0app\0version\0component\0comp_version\0`.
    pub fn marshal(&self) -> String {
        composite_key(&[
            CONFIG_OBJECT_TYPE,
            &self.msp_id,
            self.peer_id.as_deref().unwrap_or(""),
            &self.app_name,
            &self.app_version,
            self.component_name.as_deref().unwrap_or(""),
            self.component_version.as_deref().unwrap_or(""),
        ])
    }

    /// Inverse of [`ConfigKey::marshal`]. Anything that is not a config composite key yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(config_key_prefix().as_str())?;
        let rest = rest.strip_suffix(KEY_DELIMITER)?;
        let parts: Vec<&str> = rest.split(KEY_DELIMITER).collect();
        let [msp_id, peer_id, app_name, app_version, component_name, component_version] =
            parts.as_slice()
        else {
            return None;
        };
        if msp_id.is_empty() || app_name.is_empty() || app_version.is_empty() {
            return None;
        }
        if component_name.is_empty() != component_version.is_empty() {
            return None;
        }
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Some(Self {
            msp_id: msp_id.to_string(),
            peer_id: non_empty(*peer_id),
            app_name: app_name.to_string(),
            app_version: app_version.to_string(),
            component_name: non_empty(*component_name),
            component_version: non_empty(*component_version),
        })
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msp_id)?;
        if let Some(peer_id) = &self.peer_id {
            write!(f, "/{peer_id}")?;
        }
        write!(f, "/{}:{}", self.app_name, self.app_version)?;
        if let (Some(name), Some(version)) = (&self.component_name, &self.component_version) {
            write!(f, "/{name}:{version}")?;
        }
        Ok(())
    }
}

fn composite_key(parts: &[&str]) -> String {
    let mut key = String::new();
    key.push(KEY_DELIMITER);
    for part in parts {
        key.push_str(part);
        key.push(KEY_DELIMITER);
    }
    key
}

/// Every config key starts with this; used as the cheap relevance check on block writes.
pub fn config_key_prefix() -> String {
    composite_key(&[CONFIG_OBJECT_TYPE])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Json,
    Yaml,
    #[serde(other)]
    Other,
}

impl ConfigFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Other => "other",
        }
    }
}

/// On-chain envelope of a config record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue {
    #[serde(rename = "TxID")]
    pub tx_id: String,
    #[serde(rename = "Format")]
    pub format: ConfigFormat,
    #[serde(rename = "Config")]
    pub config: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    pub format: ConfigFormat,
    pub reason: String,
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {} config: {}", self.format.as_str(), self.reason)
    }
}

impl std::error::Error for FormatError {}

impl ConfigValue {
    pub fn new(tx_id: impl Into<String>, format: ConfigFormat, config: impl Into<String>) -> Self {
        Self {
            tx_id: tx_id.into(),
            format,
            config: config.into(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes the config text per its declared format.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FormatError> {
        let err = |reason: String| FormatError {
            format: self.format,
            reason,
        };
        match self.format {
            ConfigFormat::Json => serde_json::from_str(&self.config).map_err(|e| err(e.to_string())),
            ConfigFormat::Yaml => serde_yaml::from_str(&self.config).map_err(|e| err(e.to_string())),
            ConfigFormat::Other => Err(err("unsupported format".to_string())),
        }
    }

    /// Stable digest of the effective config (format + text); the tx id is excluded so that a
    /// rewrite with identical content is not treated as a change.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.format.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.config.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    NotFound { key: String },
    Decode { key: String, reason: String },
    Store(LedgerError),
}

impl ConfigError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn decode(key: &ConfigKey, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "config not found: {key}"),
            Self::Decode { key, reason } => write!(f, "config decode failed: {key}: {reason}"),
            Self::Store(e) => write!(f, "config store: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LedgerError> for ConfigError {
    fn from(value: LedgerError) -> Self {
        Self::Store(value)
    }
}

/// Read-only view of config records on one channel.
#[derive(Clone)]
pub struct ConfigStore {
    query: Arc<dyn StateQuery>,
    chaincode: String,
}

impl ConfigStore {
    pub fn new(query: Arc<dyn StateQuery>, chaincode: impl Into<String>) -> Self {
        Self {
            query,
            chaincode: chaincode.into(),
        }
    }

    pub fn chaincode(&self) -> &str {
        &self.chaincode
    }

    /// Current ledger height of the backing channel.
    pub fn height(&self) -> u64 {
        self.query.height()
    }

    pub fn get(&self, key: &ConfigKey) -> Result<ConfigValue, ConfigError> {
        let bytes = self
            .query
            .get_state(&self.chaincode, &key.marshal())?
            .ok_or_else(|| ConfigError::NotFound {
                key: key.to_string(),
            })?;
        ConfigValue::from_bytes(&bytes).map_err(|e| ConfigError::decode(key, e))
    }

    /// Every committed version of one component. Undecodable records are skipped with a warning.
    pub fn query_component_versions(
        &self,
        msp_id: &str,
        app_name: &str,
        app_version: &str,
        component_name: &str,
    ) -> Result<Vec<(ConfigKey, ConfigValue)>, ConfigError> {
        let prefix = composite_key(&[
            CONFIG_OBJECT_TYPE,
            msp_id,
            "",
            app_name,
            app_version,
            component_name,
        ]);
        let mut out = Vec::new();
        for (raw_key, bytes) in self.query.scan_prefix(&self.chaincode, &prefix)? {
            let Some(key) = ConfigKey::parse(&raw_key) else {
                warn!(key = ?raw_key, "skipping config record with malformed key");
                continue;
            };
            match ConfigValue::from_bytes(&bytes) {
                Ok(value) => out.push((key, value)),
                Err(err) => warn!(%key, error = %err, "skipping undecodable config record"),
            }
        }
        Ok(out)
    }
}
