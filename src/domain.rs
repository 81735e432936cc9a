use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DepotError;

/// Suffix appended to an imported dataset id that collides with a built-in
/// catalog id, so a user import can never silently shadow a built-in dataset.
pub const IMPORT_CONFLICT_SUFFIX: &str = "-custom";

/// Validated dataset identifier. Ids are path components in both durable
/// stores, so slashes and path escapes are rejected at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn with_conflict_suffix(&self) -> DatasetId {
        DatasetId(format!("{}{IMPORT_CONFLICT_SUFFIX}", self.0))
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = DepotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_valid = !normalized.is_empty()
            && normalized != "."
            && normalized != ".."
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(DepotError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Catalog manifest document, as served by the release channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogManifest {
    #[serde(rename = "generated")]
    pub generated_at: String,
    #[serde(rename = "releaseTag")]
    pub release_tag: String,
    #[serde(rename = "factions")]
    pub entries: Vec<ManifestEntry>,
    /// Where this manifest came from. Not part of the wire document.
    #[serde(skip, default)]
    pub source: ManifestSource,
}

impl CatalogManifest {
    pub fn entry(&self, id: &DatasetId) -> Option<&ManifestEntry> {
        self.entries.iter().find(|entry| &entry.id == id)
    }

    pub fn ids(&self) -> Vec<DatasetId> {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestSource {
    #[default]
    Network,
    /// Rebuilt from the durable snapshot; entries carry no download urls, so
    /// only previously-cached datasets are usable.
    Snapshot,
    StaticDir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub id: DatasetId,
    pub version: String,
    /// Absent on entries reconstructed from the offline snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Publication timestamp, epoch milliseconds. Together with `version`
    /// this forms the cache-invalidation key for the id.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_addon: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dataset_ids: Option<Vec<DatasetId>>,
}

impl ManifestEntry {
    /// Entry rebuilt from the snapshot: usable only against the mirror cache.
    pub fn offline(id: DatasetId) -> Self {
        Self {
            id,
            version: String::new(),
            download_url: None,
            size_bytes: None,
            timestamp: 0,
            display_name: None,
            is_addon: None,
            base_dataset_ids: None,
        }
    }
}

/// Identity block of a dataset, from the bundle's `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    pub identifier: String,
    pub display_name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Record index of a dataset, from the bundle's `units.json`. Unit records
/// are schema-free beyond being an array; consumers interpret their shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetIndex {
    pub units: Vec<serde_json::Value>,
}

/// One durable row per dataset id in either store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: DatasetId,
    /// Remote-mirror rows only; user imports have no release version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub metadata: DatasetMetadata,
    pub index: DatasetIndex,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<String>,
}

impl DatasetRecord {
    pub fn mirrored(entry: &ManifestEntry, bundle: &ParsedBundle) -> Self {
        Self {
            id: entry.id.clone(),
            version: Some(entry.version.clone()),
            timestamp: Some(entry.timestamp),
            metadata: bundle.metadata.clone(),
            index: bundle.index.clone(),
            cached_at: Some(now_rfc3339()),
            uploaded_at: None,
        }
    }

    pub fn imported(bundle: &ParsedBundle) -> Self {
        Self {
            id: bundle.dataset_id.clone(),
            version: None,
            timestamp: None,
            metadata: bundle.metadata.clone(),
            index: bundle.index.clone(),
            cached_at: None,
            uploaded_at: Some(now_rfc3339()),
        }
    }
}

/// Transient output of the bundle parser; persisted immediately into one of
/// the stores or discarded.
#[derive(Debug, Clone)]
pub struct ParsedBundle {
    pub dataset_id: DatasetId,
    pub metadata: DatasetMetadata,
    pub index: DatasetIndex,
    pub assets: BTreeMap<String, Vec<u8>>,
}

/// Durable last-known-good manifest snapshot: id list plus generation stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSnapshot {
    pub generated_at: String,
    pub release_tag: String,
    pub ids: Vec<DatasetId>,
}

impl ManifestSnapshot {
    pub fn of(manifest: &CatalogManifest) -> Self {
        Self {
            generated_at: manifest.generated_at.clone(),
            release_tag: manifest.release_tag.clone(),
            ids: manifest.ids(),
        }
    }

    /// Rebuild a download-less manifest for offline use.
    pub fn to_manifest(&self) -> CatalogManifest {
        CatalogManifest {
            generated_at: self.generated_at.clone(),
            release_tag: self.release_tag.clone(),
            entries: self.ids.iter().cloned().map(ManifestEntry::offline).collect(),
            source: ManifestSource::Snapshot,
        }
    }
}

/// One discovered dataset: local imports take precedence over catalog entries
/// with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDataset {
    pub id: DatasetId,
    pub is_local: bool,
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_dataset_id_valid() {
        let id: DatasetId = " iron-legion_v2.1 ".parse().unwrap();
        assert_eq!(id.as_str(), "iron-legion_v2.1");
    }

    #[test]
    fn parse_dataset_id_rejects_path_components() {
        assert_matches!(
            "../evil".parse::<DatasetId>(),
            Err(DepotError::InvalidDatasetId(_))
        );
        assert_matches!(
            "a/b".parse::<DatasetId>(),
            Err(DepotError::InvalidDatasetId(_))
        );
        assert_matches!("".parse::<DatasetId>(), Err(DepotError::InvalidDatasetId(_)));
    }

    #[test]
    fn conflict_suffix_is_fixed() {
        let id: DatasetId = "iron-legion".parse().unwrap();
        assert_eq!(id.with_conflict_suffix().as_str(), "iron-legion-custom");
    }

    #[test]
    fn manifest_wire_field_names() {
        let doc = serde_json::json!({
            "generated": "2026-01-01T00:00:00Z",
            "releaseTag": "2026.1",
            "factions": [{
                "id": "iron-legion",
                "version": "3",
                "downloadUrl": "https://example.test/iron-legion.zip",
                "sizeBytes": 1024,
                "timestamp": 1_700_000_000_000i64,
                "displayName": "Iron Legion"
            }]
        });
        let manifest: CatalogManifest = serde_json::from_value(doc).unwrap();
        assert_eq!(manifest.release_tag, "2026.1");
        assert_eq!(manifest.entries.len(), 1);
        let entry = &manifest.entries[0];
        assert_eq!(entry.id.as_str(), "iron-legion");
        assert_eq!(entry.timestamp, 1_700_000_000_000);
        assert_eq!(
            entry.download_url.as_deref(),
            Some("https://example.test/iron-legion.zip")
        );
        assert_eq!(manifest.source, ManifestSource::Network);
    }

    #[test]
    fn snapshot_round_trip_loses_download_urls() {
        let manifest = CatalogManifest {
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            release_tag: "2026.1".to_string(),
            entries: vec![ManifestEntry {
                id: "iron-legion".parse().unwrap(),
                version: "3".to_string(),
                download_url: Some("https://example.test/a.zip".to_string()),
                size_bytes: None,
                timestamp: 42,
                display_name: None,
                is_addon: None,
                base_dataset_ids: None,
            }],
            source: ManifestSource::Network,
        };
        let rebuilt = ManifestSnapshot::of(&manifest).to_manifest();
        assert_eq!(rebuilt.source, ManifestSource::Snapshot);
        assert_eq!(rebuilt.entries[0].id.as_str(), "iron-legion");
        assert!(rebuilt.entries[0].download_url.is_none());
    }
}
