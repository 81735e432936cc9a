use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{DatasetId, DatasetRecord, ManifestSnapshot};
use crate::error::DepotError;

const DATASETS_DIR: &str = "datasets";
const RECORD_FILE: &str = "record.json";
const ASSETS_DIR: &str = "assets";
const SNAPSHOT_FILE: &str = "manifest_snapshot.json";

/// Durable dataset storage under a single root directory.
///
/// Layout: `<root>/datasets/<id>/record.json` for the record row and
/// `<root>/datasets/<id>/assets/<path>` for each asset row. A `put` stages
/// the whole dataset directory next to its destination and promotes it with
/// one directory rename, so a reader never observes a record without its
/// assets or vice versa.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: Utf8PathBuf,
}

impl DatasetStore {
    pub fn open(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn datasets_root(&self) -> Utf8PathBuf {
        self.root.join(DATASETS_DIR)
    }

    fn dataset_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.datasets_root().join(id.as_str())
    }

    fn record_path(&self, id: &DatasetId) -> Utf8PathBuf {
        self.dataset_dir(id).join(RECORD_FILE)
    }

    pub fn has(&self, id: &DatasetId) -> bool {
        self.record_path(id).as_std_path().exists()
    }

    pub fn get(&self, id: &DatasetId) -> Result<Option<DatasetRecord>, DepotError> {
        let path = self.record_path(id);
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(DepotError::Persistence(format!("read {path}: {err}"))),
        };
        let record = serde_json::from_str(&content)
            .map_err(|err| DepotError::Persistence(format!("corrupt record {path}: {err}")))?;
        Ok(Some(record))
    }

    /// All-or-nothing write of a record plus its assets. An existing dataset
    /// directory is replaced wholesale.
    pub fn put(
        &self,
        record: &DatasetRecord,
        assets: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), DepotError> {
        let datasets_root = self.datasets_root();
        fs::create_dir_all(datasets_root.as_std_path())
            .map_err(|err| DepotError::Persistence(err.to_string()))?;

        let temp_dir = tempfile::Builder::new()
            .prefix("fdepot-put")
            .tempdir_in(datasets_root.as_std_path())
            .map_err(|err| DepotError::Persistence(err.to_string()))?;

        let record_bytes = serde_json::to_vec_pretty(record)
            .map_err(|err| DepotError::Persistence(err.to_string()))?;
        fs::write(temp_dir.path().join(RECORD_FILE), &record_bytes)
            .map_err(|err| DepotError::Persistence(err.to_string()))?;

        for (relative, bytes) in assets {
            let target = safe_asset_target(&temp_dir.path().join(ASSETS_DIR), relative)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| DepotError::Persistence(err.to_string()))?;
            }
            fs::write(&target, bytes).map_err(|err| DepotError::Persistence(err.to_string()))?;
        }

        atomic_rename_dir(temp_dir.path(), self.dataset_dir(&record.id).as_std_path())
            .map_err(|err| DepotError::Persistence(err.to_string()))?;
        Ok(())
    }

    pub fn get_asset(
        &self,
        id: &DatasetId,
        asset_path: &str,
    ) -> Result<Option<Vec<u8>>, DepotError> {
        let assets_dir = self.dataset_dir(id).join(ASSETS_DIR);
        let target = safe_asset_target(assets_dir.as_std_path(), asset_path)?;
        match fs::read(&target) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DepotError::Persistence(format!(
                "read asset {id}/{asset_path}: {err}"
            ))),
        }
    }

    /// Removes the record and every asset row under the id prefix.
    pub fn delete(&self, id: &DatasetId) -> Result<(), DepotError> {
        let dir = self.dataset_dir(id);
        if dir.as_std_path().exists() {
            fs::remove_dir_all(dir.as_std_path())
                .map_err(|err| DepotError::Persistence(err.to_string()))?;
        }
        Ok(())
    }

    pub fn list_ids(&self) -> Result<Vec<DatasetId>, DepotError> {
        let datasets_root = self.datasets_root();
        if !datasets_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let entries = fs::read_dir(datasets_root.as_std_path())
            .map_err(|err| DepotError::Persistence(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| DepotError::Persistence(err.to_string()))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Skip staging directories left behind by an interrupted put.
            if name.starts_with("fdepot-put") {
                continue;
            }
            if let Ok(id) = name.parse::<DatasetId>() {
                if self.has(&id) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Store for user-imported datasets. Rows carry `uploaded_at` and no release
/// version.
#[derive(Debug, Clone)]
pub struct LocalStore {
    store: DatasetStore,
}

impl LocalStore {
    pub fn open(root: Utf8PathBuf) -> Self {
        Self {
            store: DatasetStore::open(root),
        }
    }

    pub fn is_cached(&self, id: &DatasetId) -> bool {
        self.store.has(id)
    }

    pub fn get(&self, id: &DatasetId) -> Result<Option<DatasetRecord>, DepotError> {
        self.store.get(id)
    }

    pub fn put(
        &self,
        record: &DatasetRecord,
        assets: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), DepotError> {
        self.store.put(record, assets)
    }

    pub fn get_asset(
        &self,
        id: &DatasetId,
        asset_path: &str,
    ) -> Result<Option<Vec<u8>>, DepotError> {
        self.store.get_asset(id, asset_path)
    }

    pub fn delete(&self, id: &DatasetId) -> Result<(), DepotError> {
        self.store.delete(id)
    }

    pub fn list_ids(&self) -> Result<Vec<DatasetId>, DepotError> {
        self.store.list_ids()
    }
}

/// Store for datasets mirrored from the release channel. Rows are keyed for
/// invalidation by the manifest's version+timestamp pair, and the store holds
/// the single-row manifest snapshot used for offline fallback.
#[derive(Debug, Clone)]
pub struct MirrorCache {
    store: DatasetStore,
}

impl MirrorCache {
    pub fn open(root: Utf8PathBuf) -> Self {
        Self {
            store: DatasetStore::open(root),
        }
    }

    /// Freshness check: both fields must match the cached row. A mismatch on
    /// either means "not cached" and forces a re-download.
    pub fn is_cached(&self, id: &DatasetId, version: &str, timestamp: i64) -> bool {
        match self.store.get(id) {
            Ok(Some(record)) => {
                record.version.as_deref() == Some(version) && record.timestamp == Some(timestamp)
            }
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "mirror record unreadable, treating as miss");
                false
            }
        }
    }

    pub fn get(&self, id: &DatasetId) -> Result<Option<DatasetRecord>, DepotError> {
        self.store.get(id)
    }

    pub fn put(
        &self,
        record: &DatasetRecord,
        assets: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), DepotError> {
        self.store.put(record, assets)
    }

    pub fn get_asset(
        &self,
        id: &DatasetId,
        asset_path: &str,
    ) -> Result<Option<Vec<u8>>, DepotError> {
        self.store.get_asset(id, asset_path)
    }

    pub fn delete(&self, id: &DatasetId) -> Result<(), DepotError> {
        self.store.delete(id)
    }

    pub fn list_ids(&self) -> Result<Vec<DatasetId>, DepotError> {
        self.store.list_ids()
    }

    /// Deletes every mirrored dataset whose id is absent from `current_ids`.
    /// Returns the pruned ids so the caller can revoke their live handles.
    pub fn prune_stale(
        &self,
        current_ids: &HashSet<DatasetId>,
    ) -> Result<Vec<DatasetId>, DepotError> {
        let mut pruned = Vec::new();
        for id in self.store.list_ids()? {
            if !current_ids.contains(&id) {
                tracing::info!(id = %id, "pruning dataset no longer in catalog");
                self.store.delete(&id)?;
                pruned.push(id);
            }
        }
        Ok(pruned)
    }

    fn snapshot_path(&self) -> Utf8PathBuf {
        self.store.root().join(SNAPSHOT_FILE)
    }

    pub fn read_snapshot(&self) -> Result<Option<ManifestSnapshot>, DepotError> {
        let path = self.snapshot_path();
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(DepotError::Persistence(format!("read {path}: {err}"))),
        };
        let snapshot = serde_json::from_str(&content)
            .map_err(|err| DepotError::Persistence(format!("corrupt snapshot {path}: {err}")))?;
        Ok(Some(snapshot))
    }

    pub fn write_snapshot(&self, snapshot: &ManifestSnapshot) -> Result<(), DepotError> {
        let path = self.snapshot_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| DepotError::Persistence(err.to_string()))?;
        }
        let content = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| DepotError::Persistence(err.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| DepotError::Persistence(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| DepotError::Persistence(err.to_string()))?;
        Ok(())
    }
}

/// Resolve an asset's relative path under `assets_dir`, rejecting absolute
/// paths and parent-directory escapes.
fn safe_asset_target(assets_dir: &Path, relative: &str) -> Result<std::path::PathBuf, DepotError> {
    use std::path::Component;

    let rel = Path::new(relative);
    let escapes = rel
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));
    if relative.is_empty() || escapes {
        return Err(DepotError::Persistence(format!(
            "unsafe asset path: {relative:?}"
        )));
    }
    Ok(assets_dir.join(rel))
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DatasetIndex, DatasetMetadata};

    fn record(id: &str) -> DatasetRecord {
        DatasetRecord {
            id: id.parse().unwrap(),
            version: Some("1".to_string()),
            timestamp: Some(100),
            metadata: DatasetMetadata {
                identifier: id.to_string(),
                display_name: id.to_string(),
                version: "1".to_string(),
                kind: "army".to_string(),
                author: None,
                description: None,
            },
            index: DatasetIndex { units: Vec::new() },
            cached_at: Some("2026-01-01T00:00:00Z".to_string()),
            uploaded_at: None,
        }
    }

    #[test]
    fn put_get_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let store =
            DatasetStore::open(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());

        let mut assets = BTreeMap::new();
        assets.insert("flags/banner.png".to_string(), b"png".to_vec());
        store.put(&record("iron-legion"), &assets).unwrap();

        let id = "iron-legion".parse().unwrap();
        let loaded = store.get(&id).unwrap().unwrap();
        assert_eq!(loaded.version.as_deref(), Some("1"));
        assert_eq!(
            store.get_asset(&id, "flags/banner.png").unwrap(),
            Some(b"png".to_vec())
        );
        assert_eq!(store.get_asset(&id, "missing.png").unwrap(), None);
    }

    #[test]
    fn delete_removes_record_and_assets() {
        let temp = tempfile::tempdir().unwrap();
        let store =
            DatasetStore::open(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());

        let mut assets = BTreeMap::new();
        assets.insert("a.bin".to_string(), vec![1, 2, 3]);
        store.put(&record("iron-legion"), &assets).unwrap();

        let id: DatasetId = "iron-legion".parse().unwrap();
        store.delete(&id).unwrap();
        assert!(store.get(&id).unwrap().is_none());
        assert!(store.get_asset(&id, "a.bin").unwrap().is_none());
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[test]
    fn unsafe_asset_paths_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let store =
            DatasetStore::open(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        let mut assets = BTreeMap::new();
        assets.insert("../escape.bin".to_string(), vec![0]);
        assert!(store.put(&record("iron-legion"), &assets).is_err());
    }

    #[test]
    fn mirror_freshness_needs_both_fields() {
        let temp = tempfile::tempdir().unwrap();
        let mirror =
            MirrorCache::open(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        mirror.put(&record("iron-legion"), &BTreeMap::new()).unwrap();

        let id: DatasetId = "iron-legion".parse().unwrap();
        assert!(mirror.is_cached(&id, "1", 100));
        assert!(!mirror.is_cached(&id, "2", 100));
        assert!(!mirror.is_cached(&id, "1", 101));
        assert!(!mirror.is_cached(&"absent".parse().unwrap(), "1", 100));
    }

    #[test]
    fn prune_keeps_only_current_ids() {
        let temp = tempfile::tempdir().unwrap();
        let mirror =
            MirrorCache::open(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        for id in ["alpha", "bravo", "charlie"] {
            let mut assets = BTreeMap::new();
            assets.insert("icon.png".to_string(), vec![7]);
            mirror.put(&record(id), &assets).unwrap();
        }

        let current: HashSet<DatasetId> = ["alpha".parse().unwrap(), "charlie".parse().unwrap()]
            .into_iter()
            .collect();
        let pruned = mirror.prune_stale(&current).unwrap();
        assert_eq!(pruned, vec!["bravo".parse().unwrap()]);

        let remaining = mirror.list_ids().unwrap();
        assert_eq!(
            remaining,
            vec!["alpha".parse().unwrap(), "charlie".parse().unwrap()]
        );
        let bravo: DatasetId = "bravo".parse().unwrap();
        assert!(mirror.get_asset(&bravo, "icon.png").unwrap().is_none());
    }

    #[test]
    fn snapshot_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let mirror =
            MirrorCache::open(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        assert!(mirror.read_snapshot().unwrap().is_none());

        let snapshot = ManifestSnapshot {
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            release_tag: "2026.1".to_string(),
            ids: vec!["alpha".parse().unwrap()],
        };
        mirror.write_snapshot(&snapshot).unwrap();
        let loaded = mirror.read_snapshot().unwrap().unwrap();
        assert_eq!(loaded.ids, snapshot.ids);
        assert_eq!(loaded.release_tag, "2026.1");
    }
}
