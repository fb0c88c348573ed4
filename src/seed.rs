//! Ledger seed files for the in-memory ledger used by the binary.
//!
//! ```yaml
//! channels:
//!   - id: mychannel
//!     height: 10
//!     records:
//!       - mspId: Org1MSP
//!         peerId: peer1.example.com
//!         appName: sidetree
//!         appVersion: "1"
//!         format: json
//!         config: '{"Namespaces":[{"Namespace":"did:sidetree","BasePath":"/document"}]}'
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::{
    config_store::{
        ConfigFormat, ConfigKey, ConfigValue, GLOBAL_MSP_ID, PROTOCOL_COMPONENT_NAME,
        SIDETREE_APP_NAME,
    },
    ledger::{BlockBuilder, MemLedger},
    peer_config::{NamespaceAppConfig, PeerConfig},
    protocol::ProtocolParameters,
};

#[derive(Debug)]
pub enum SeedError {
    Io { path: String, reason: String },
    Parse { reason: String },
    Invalid { reason: String },
}

impl std::fmt::Display for SeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, reason } => write!(f, "read seed {path}: {reason}"),
            Self::Parse { reason } => write!(f, "parse seed: {reason}"),
            Self::Invalid { reason } => write!(f, "invalid seed: {reason}"),
        }
    }
}

impl std::error::Error for SeedError {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Seed {
    #[serde(default)]
    pub channels: Vec<SeedChannel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeedChannel {
    pub id: String,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub records: Vec<SeedRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeedRecord {
    pub msp_id: String,
    #[serde(default)]
    pub peer_id: Option<String>,
    pub app_name: String,
    pub app_version: String,
    #[serde(default)]
    pub component_name: Option<String>,
    #[serde(default)]
    pub component_version: Option<String>,
    #[serde(default)]
    pub tx_id: Option<String>,
    pub format: ConfigFormat,
    pub config: String,
}

impl SeedRecord {
    pub fn key(&self) -> ConfigKey {
        ConfigKey {
            msp_id: self.msp_id.clone(),
            peer_id: self.peer_id.clone().filter(|s| !s.is_empty()),
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            component_name: self.component_name.clone().filter(|s| !s.is_empty()),
            component_version: self.component_version.clone().filter(|s| !s.is_empty()),
        }
    }

    pub fn value(&self) -> ConfigValue {
        ConfigValue::new(
            self.tx_id.clone().unwrap_or_else(|| "seed".to_string()),
            self.format,
            self.config.clone(),
        )
    }
}

/// Parses YAML (a superset of JSON, so JSON seeds work too).
pub fn parse(raw: &str) -> Result<Seed, SeedError> {
    let seed: Seed = serde_yaml::from_str(raw).map_err(|e| SeedError::Parse {
        reason: e.to_string(),
    })?;
    for channel in seed.channels.iter() {
        if channel.id.trim().is_empty() {
            return Err(SeedError::Invalid {
                reason: "channel id is empty".to_string(),
            });
        }
        for record in channel.records.iter() {
            let key = record.key();
            if ConfigKey::parse(&key.marshal()).as_ref() != Some(&key) {
                return Err(SeedError::Invalid {
                    reason: format!("malformed record key {key} on channel {}", channel.id),
                });
            }
        }
    }
    Ok(seed)
}

pub fn load(path: &Path) -> Result<Seed, SeedError> {
    let raw = std::fs::read_to_string(path).map_err(|e| SeedError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse(&raw)
}

/// Creates every seeded channel and commits its records as block 0.
pub fn apply(seed: &Seed, ledger: &MemLedger, chaincode: &str) -> Result<(), SeedError> {
    for channel in seed.channels.iter() {
        let mem = ledger.create_channel(&channel.id);
        let mut block = BlockBuilder::new(&channel.id, 0);
        let mut tx = block.transaction("seed", true);
        for record in channel.records.iter() {
            let bytes = record.value().to_bytes().map_err(|e| SeedError::Invalid {
                reason: e.to_string(),
            })?;
            tx = tx.write(chaincode, &record.key().marshal(), bytes);
        }
        mem.commit(&block.build());
        if let Some(height) = channel.height {
            mem.set_height(height.max(1));
        }
        info!(
            channel_id = %channel.id,
            records = channel.records.len(),
            "seed applied"
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub lines: Vec<String>,
    pub errors: Vec<String>,
}

impl SeedReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Decodes every record the way the running peer would and reports what it found.
pub fn check(seed: &Seed) -> SeedReport {
    let mut report = SeedReport::default();
    for channel in seed.channels.iter() {
        for record in channel.records.iter() {
            let key = record.key();
            let value = record.value();
            let at = format!("{}: {key}", channel.id);
            match classify(&key) {
                RecordKind::Peer => match value.decode::<PeerConfig>() {
                    Ok(cfg) => {
                        let desired = cfg.desired();
                        for ns in desired.accepted.values() {
                            report.lines.push(format!(
                                "{at}: namespace {} at {}",
                                ns.namespace, ns.base_path
                            ));
                        }
                        for (ns, reason) in desired.rejected {
                            report
                                .errors
                                .push(format!("{at}: namespace {}: {reason}", ns.namespace));
                        }
                    }
                    Err(err) => report.errors.push(format!("{at}: {err}")),
                },
                RecordKind::App => match value.decode::<NamespaceAppConfig>() {
                    Ok(cfg) => report.lines.push(format!(
                        "{at}: batch writer timeout {}",
                        cfg.batch_writer_timeout
                            .map(|d| format!("{}ms", d.as_millis()))
                            .unwrap_or_else(|| "default".to_string())
                    )),
                    Err(err) => report.errors.push(format!("{at}: {err}")),
                },
                RecordKind::Protocol => match value
                    .decode::<ProtocolParameters>()
                    .map_err(|e| e.to_string())
                    .and_then(|p| p.validate().map(|()| p))
                {
                    Ok(p) => report.lines.push(format!(
                        "{at}: protocol from {} max {} ops/batch, {} bytes/op",
                        p.starting_blockchain_time,
                        p.max_operations_per_batch,
                        p.max_operation_byte_size
                    )),
                    Err(err) => report.errors.push(format!("{at}: {err}")),
                },
                RecordKind::Other => report.lines.push(format!("{at}: not interpreted")),
            }
        }
    }
    report
}

enum RecordKind {
    Peer,
    App,
    Protocol,
    Other,
}

fn classify(key: &ConfigKey) -> RecordKind {
    match (&key.peer_id, key.component_name.as_deref()) {
        (Some(_), None) if key.app_name == SIDETREE_APP_NAME => RecordKind::Peer,
        (None, None) if key.msp_id == GLOBAL_MSP_ID => RecordKind::App,
        (None, Some(PROTOCOL_COMPONENT_NAME)) if key.msp_id == GLOBAL_MSP_ID => {
            RecordKind::Protocol
        }
        _ => RecordKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config_store::{ConfigStore, SIDETREE_APP_VERSION},
        ledger::StateQuery,
    };

    const SEED: &str = r#"
channels:
  - id: mychannel
    height: 7
    records:
      - mspId: Org1MSP
        peerId: peer1.example.com
        appName: sidetree
        appVersion: "1"
        format: json
        config: '{"Namespaces":[{"Namespace":"did:sidetree","BasePath":"/document"}]}'
      - mspId: general
        appName: did:sidetree
        appVersion: "1"
        format: yaml
        config: "batchWriterTimeout: 1s"
      - mspId: general
        appName: did:sidetree
        appVersion: "1"
        componentName: protocol
        componentVersion: "0.5"
        format: json
        config: '{"startingBlockchainTime":0,"hashAlgorithmInMultihashCode":18,"maxOperationByteSize":2000,"maxOperationsPerBatch":10}'
"#;

    #[test]
    fn applies_records_as_committed_state() {
        let seed = parse(SEED).unwrap();
        let ledger = MemLedger::new();
        apply(&seed, &ledger, "configscc").unwrap();

        let channel = ledger.get_channel("mychannel").unwrap();
        assert_eq!(channel.height(), 7);
        let store = ConfigStore::new(channel, "configscc");
        let value = store
            .get(&ConfigKey::peer(
                "Org1MSP",
                "peer1.example.com",
                SIDETREE_APP_NAME,
                SIDETREE_APP_VERSION,
            ))
            .unwrap();
        assert_eq!(value.tx_id, "seed");
        let cfg: PeerConfig = value.decode().unwrap();
        assert_eq!(cfg.namespaces.len(), 1);
    }

    #[test]
    fn check_reports_decoded_records() {
        let report = check(&parse(SEED).unwrap());
        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.lines.len(), 3);
        assert!(report.lines[0].contains("namespace did:sidetree at /document"));
        assert!(report.lines[1].contains("1000ms"));
        assert!(report.lines[2].contains("10 ops/batch"));
    }

    #[test]
    fn check_reports_garbled_records() {
        let seed = parse(
            r#"
channels:
  - id: mychannel
    records:
      - mspId: general
        appName: did:sidetree
        appVersion: "1"
        componentName: protocol
        componentVersion: "0.5"
        format: json
        config: '{"startingBlockchainTime":0,"maxOperationByteSize":0}'
"#,
        )
        .unwrap();
        let report = check(&seed);
        assert!(!report.is_ok());
    }

    #[test]
    fn json_seed_is_accepted() {
        let seed = parse(r#"{"channels":[{"id":"mychannel","records":[]}]}"#).unwrap();
        assert_eq!(seed.channels[0].id, "mychannel");
    }

    #[test]
    fn rejects_unknown_fields_and_bad_keys() {
        assert!(matches!(parse("chanels: []"), Err(SeedError::Parse { .. })));
        let err = parse(
            r#"
channels:
  - id: mychannel
    records:
      - mspId: general
        appName: did:sidetree
        appVersion: "1"
        componentName: protocol
        format: json
        config: "{}"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SeedError::Invalid { .. }));
    }
}
