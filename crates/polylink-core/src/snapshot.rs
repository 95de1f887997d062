//! Config snapshot received from the peer and the store holding the latest one.
//!
//! A snapshot always arrives whole and replaces the previous one; nothing in
//! here patches or merges snapshots.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::driver::Driver;
use crate::error::{PolyError, PolyResult};

/// One node as recorded by the peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub node_def_id: Option<String>,
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub drivers: Vec<Driver>,
    #[serde(default, rename = "isprimary")]
    pub is_primary: Option<bool>,
    /// Milliseconds since the epoch
    #[serde(default, rename = "timeAdded", alias = "time_added")]
    pub time_added: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub added: Option<bool>,
}

impl SnapshotNode {
    pub fn time_added_at(&self) -> Option<DateTime<Utc>> {
        self.time_added
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

/// Full remote configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    /// Malformed entries are skipped, never fatal to the whole snapshot
    #[serde(default, deserialize_with = "lenient_nodes")]
    pub nodes: Vec<SnapshotNode>,
    #[serde(default)]
    pub custom_params: Map<String, Value>,
    #[serde(default)]
    pub custom_data: Map<String, Value>,
    /// Keyed object on current peers, plain array on older ones
    #[serde(default)]
    pub notices: Value,
    #[serde(default)]
    pub isy_version: Option<String>,
    #[serde(default)]
    pub features: Value,
}

fn lenient_nodes<'de, D>(deserializer: D) -> Result<Vec<SnapshotNode>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(node) => Some(node),
            Err(e) => {
                warn!(index, "Skipping malformed node in config: {}", e);
                None
            }
        })
        .collect())
}

impl ConfigSnapshot {
    pub fn node(&self, address: &str) -> Option<&SnapshotNode> {
        self.nodes.iter().find(|n| n.address == address)
    }
}

/// Holds the last snapshot received.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: Option<ConfigSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored snapshot.
    pub fn replace(&mut self, snapshot: ConfigSnapshot) -> &ConfigSnapshot {
        self.current.insert(snapshot)
    }

    pub fn get(&self) -> Option<&ConfigSnapshot> {
        self.current.as_ref()
    }

    pub fn has_config(&self) -> bool {
        self.current.is_some()
    }

    /// Look up a node by address. `None` before any snapshot has arrived.
    pub fn node(&self, address: &str) -> Option<&SnapshotNode> {
        self.current.as_ref()?.node(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.node(address).is_some()
    }

    pub fn isy_version(&self) -> Option<&str> {
        self.current.as_ref()?.isy_version.as_deref()
    }

    pub fn custom_params(&self) -> PolyResult<&Map<String, Value>> {
        self.require().map(|c| &c.custom_params)
    }

    pub fn custom_params_mut(&mut self) -> PolyResult<&mut Map<String, Value>> {
        self.require_mut().map(|c| &mut c.custom_params)
    }

    pub fn custom_data_mut(&mut self) -> PolyResult<&mut Map<String, Value>> {
        self.require_mut().map(|c| &mut c.custom_data)
    }

    fn require(&self) -> PolyResult<&ConfigSnapshot> {
        self.current
            .as_ref()
            .ok_or_else(|| PolyError::State("no config received yet".into()))
    }

    fn require_mut(&mut self) -> PolyResult<&mut ConfigSnapshot> {
        self.current
            .as_mut()
            .ok_or_else(|| PolyError::State("no config received yet".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ConfigSnapshot {
        serde_json::from_value(json!({
            "nodes": [{
                "address": "device1",
                "drivers": [{"driver": "ST", "value": "1", "uom": 2}],
                "isprimary": false,
                "timeAdded": 1_500_000_000_000i64,
                "enabled": true,
                "added": true
            }],
            "customParams": {"host": "10.0.0.2"},
            "isyVersion": "5.0.10",
            "notices": {}
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_snapshot() {
        let snapshot = sample();
        let node = snapshot.node("device1").unwrap();
        assert_eq!(node.is_primary, Some(false));
        assert_eq!(node.enabled, Some(true));
        assert_eq!(node.drivers.len(), 1);
        assert_eq!(
            node.time_added_at().unwrap().timestamp(),
            1_500_000_000
        );
        assert_eq!(snapshot.isy_version.as_deref(), Some("5.0.10"));
    }

    #[test]
    fn test_malformed_node_entries_are_skipped() {
        let snapshot: ConfigSnapshot = serde_json::from_value(json!({
            "nodes": [
                {"address": "controller"},
                {"address": "bad1", "drivers": [{"driver": "ST", "value": null, "uom": 2}]},
                {"address": "bad2", "drivers": [{"driver": "ST", "value": 1, "uom": "2"}]},
                "not a node",
                {"address": "device1", "drivers": [{"driver": "ST", "value": 1, "uom": 2}]}
            ],
            "customParams": {"host": "10.0.0.2"}
        }))
        .unwrap();

        let addresses: Vec<&str> = snapshot.nodes.iter().map(|n| n.address.as_str()).collect();
        assert_eq!(addresses, vec!["controller", "device1"]);
        assert_eq!(snapshot.custom_params["host"], "10.0.0.2");

        let snapshot: ConfigSnapshot = serde_json::from_value(json!({"nodes": null})).unwrap();
        assert!(snapshot.nodes.is_empty());
    }

    #[test]
    fn test_legacy_time_added_alias() {
        let node: SnapshotNode =
            serde_json::from_value(json!({"address": "a", "time_added": 5})).unwrap();
        assert_eq!(node.time_added, Some(5));
    }

    #[test]
    fn test_store_before_config() {
        let mut store = SnapshotStore::new();
        assert!(!store.has_config());
        assert!(store.node("device1").is_none());
        assert!(matches!(store.custom_params(), Err(PolyError::State(_))));
        assert!(store.custom_params_mut().is_err());
    }

    #[test]
    fn test_store_replaces() {
        let mut store = SnapshotStore::new();
        store.replace(sample());
        assert!(store.contains("device1"));
        store.replace(ConfigSnapshot::default());
        assert!(!store.contains("device1"));
        assert!(store.custom_params().unwrap().is_empty());
    }
}
