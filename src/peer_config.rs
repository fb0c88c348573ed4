//! Typed records decoded from the loosely-typed on-chain config text.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};

/// Peer-level record listing the namespaces this peer serves. `{}` means none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(rename = "Namespaces", default)]
    pub namespaces: Vec<NamespaceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "BasePath")]
    pub base_path: String,
}

impl NamespaceConfig {
    pub fn new(namespace: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            base_path: base_path.into(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.trim().is_empty() {
            return Err("namespace is empty".to_string());
        }
        if self.namespace.contains('/') || self.namespace.contains('\u{0}') {
            return Err(format!("namespace contains reserved characters: {}", self.namespace));
        }
        validate_base_path(&self.base_path)
    }
}

pub fn validate_base_path(base_path: &str) -> Result<(), String> {
    if !base_path.starts_with('/') {
        return Err(format!("base path must start with '/': {base_path}"));
    }
    if base_path == "/" {
        return Err("base path must not be '/'".to_string());
    }
    if base_path.ends_with('/') {
        return Err(format!("base path must not end with '/': {base_path}"));
    }
    if base_path.contains("//") || base_path.chars().any(char::is_whitespace) {
        return Err(format!("invalid base path: {base_path}"));
    }
    Ok(())
}

/// Outcome of validating the namespace list of a [`PeerConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredNamespaces {
    pub accepted: BTreeMap<String, NamespaceConfig>,
    pub rejected: Vec<(NamespaceConfig, String)>,
}

impl DesiredNamespaces {
    /// Every namespace named by the record, valid or not.
    pub fn tracked(&self) -> BTreeSet<String> {
        self.accepted
            .keys()
            .cloned()
            .chain(self.rejected.iter().map(|(ns, _)| ns.namespace.clone()))
            .filter(|ns| !ns.trim().is_empty())
            .collect()
    }
}

impl PeerConfig {
    /// First occurrence wins for duplicated namespaces and base paths.
    pub fn desired(&self) -> DesiredNamespaces {
        let mut out = DesiredNamespaces::default();
        let mut base_paths = BTreeSet::new();
        for ns in self.namespaces.iter() {
            if let Err(reason) = ns.validate() {
                out.rejected.push((ns.clone(), reason));
                continue;
            }
            if out.accepted.contains_key(&ns.namespace) {
                out.rejected
                    .push((ns.clone(), "duplicate namespace".to_string()));
                continue;
            }
            if !base_paths.insert(ns.base_path.clone()) {
                out.rejected
                    .push((ns.clone(), "duplicate base path".to_string()));
                continue;
            }
            out.accepted.insert(ns.namespace.clone(), ns.clone());
        }
        out
    }
}

/// Application-level record of one namespace (JSON or YAML).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceAppConfig {
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub batch_writer_timeout: Option<Duration>,
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Parses durations such as `5s`, `500ms`, `1m30s` or `1.5h`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration: {raw}"))?;
        if num_len == 0 {
            return Err(format!("invalid duration: {raw}"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid number in duration: {raw}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit: f64 = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            unit => return Err(format!("unknown unit {unit:?} in duration: {raw}")),
        };
        rest = &rest[unit_len..];

        let nanos = value * nanos_per_unit;
        if !nanos.is_finite() || nanos > u64::MAX as f64 {
            return Err(format!("duration out of range: {raw}"));
        }
        total = total
            .checked_add(Duration::from_nanos(nanos as u64))
            .ok_or_else(|| format!("duration out of range: {raw}"))?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_go_style_durations() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5 days").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn empty_peer_config_has_no_namespaces() {
        let cfg: PeerConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.desired().accepted.is_empty());
    }

    #[test]
    fn peer_config_ignores_unknown_fields() {
        let cfg: PeerConfig = serde_json::from_str(
            r#"{"Monitor":{"Period":"5s"},"Namespaces":[{"Namespace":"did:sidetree","BasePath":"/document"}]}"#,
        )
        .unwrap();
        let desired = cfg.desired();
        assert_eq!(
            desired.accepted.get("did:sidetree"),
            Some(&NamespaceConfig::new("did:sidetree", "/document"))
        );
    }

    #[test]
    fn invalid_and_duplicate_entries_are_rejected_individually() {
        let cfg = PeerConfig {
            namespaces: vec![
                NamespaceConfig::new("did:a", "/a"),
                NamespaceConfig::new("did:b", "b"),
                NamespaceConfig::new("did:a", "/other"),
                NamespaceConfig::new("did:c", "/a"),
                NamespaceConfig::new("did:d", "/d"),
            ],
        };
        let desired = cfg.desired();
        assert_eq!(
            desired.accepted.keys().cloned().collect::<Vec<_>>(),
            vec!["did:a".to_string(), "did:d".to_string()]
        );
        assert_eq!(desired.rejected.len(), 3);
        assert_eq!(
            desired.tracked(),
            BTreeSet::from([
                "did:a".to_string(),
                "did:b".to_string(),
                "did:c".to_string(),
                "did:d".to_string(),
            ])
        );
    }

    #[test]
    fn base_path_rules() {
        assert!(validate_base_path("/document").is_ok());
        assert!(validate_base_path("/trustbloc.dev").is_ok());
        assert!(validate_base_path("/").is_err());
        assert!(validate_base_path("/document/").is_err());
        assert!(validate_base_path("document").is_err());
        assert!(validate_base_path("/a//b").is_err());
    }

    #[test]
    fn app_config_reads_batch_writer_timeout() {
        let cfg: NamespaceAppConfig =
            serde_yaml::from_str("batchWriterTimeout: 1s").unwrap();
        assert_eq!(cfg.batch_writer_timeout, Some(Duration::from_secs(1)));

        let cfg: NamespaceAppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.batch_writer_timeout, None);

        assert!(serde_json::from_str::<NamespaceAppConfig>(r#"{"batchWriterTimeout":"soon"}"#).is_err());
    }
}
