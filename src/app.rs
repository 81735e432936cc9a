use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::bundle;
use crate::channel::ReleaseChannel;
use crate::domain::{
    CatalogManifest, DatasetId, DatasetIndex, DatasetMetadata, DatasetRecord, DiscoveredDataset,
    ParsedBundle,
};
use crate::error::DepotError;
use crate::handles::{AssetUrlManager, BlobRuntime};
use crate::manifest::ManifestLoader;
use crate::store::{LocalStore, MirrorCache};

/// The composition root and consumer-facing façade.
///
/// Owns both persistent stores, the session manifest loader and the handle
/// map as explicit long-lived instances; everything the UI layer calls goes
/// through here.
pub struct Depot {
    local: Arc<LocalStore>,
    mirror: Arc<MirrorCache>,
    channel: Arc<dyn ReleaseChannel>,
    manifest: ManifestLoader,
    urls: AssetUrlManager,
}

impl Depot {
    pub fn new(
        local: LocalStore,
        mirror: MirrorCache,
        channel: Arc<dyn ReleaseChannel>,
        runtime: Arc<dyn BlobRuntime>,
    ) -> Self {
        let local = Arc::new(local);
        let mirror = Arc::new(mirror);
        let manifest = ManifestLoader::new(channel.clone(), mirror.clone());
        let urls = AssetUrlManager::new(local.clone(), mirror.clone(), runtime);
        Self {
            local,
            mirror,
            channel,
            manifest,
            urls,
        }
    }

    /// Union of locally-imported dataset ids and the current catalog.
    /// A manifest failure (after the offline snapshot fallback has been
    /// tried) propagates, so callers can tell "catalog unreachable" apart
    /// from an empty catalog.
    pub async fn discover(&self) -> Result<Vec<DiscoveredDataset>, DepotError> {
        let local_ids = self.local.list_ids()?;
        let manifest = self.load_manifest().await?;

        let local_set: HashSet<&DatasetId> = local_ids.iter().collect();
        let mut datasets: Vec<DiscoveredDataset> = local_ids
            .iter()
            .map(|id| DiscoveredDataset {
                id: id.clone(),
                is_local: true,
            })
            .collect();
        for entry in &manifest.entries {
            if !local_set.contains(&entry.id) {
                datasets.push(DiscoveredDataset {
                    id: entry.id.clone(),
                    is_local: false,
                });
            }
        }
        datasets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(datasets)
    }

    pub async fn load_metadata(&self, id: &DatasetId) -> Result<DatasetMetadata, DepotError> {
        Ok(self.resolve_record(id, self.local.is_cached(id)).await?.metadata)
    }

    pub async fn load_index(&self, id: &DatasetId) -> Result<DatasetIndex, DepotError> {
        Ok(self.resolve_record(id, self.local.is_cached(id)).await?.index)
    }

    /// Resolve a dataset's full record from whichever store owns it,
    /// downloading and caching a fresh copy when the mirror is stale.
    pub async fn resolve_record(
        &self,
        id: &DatasetId,
        is_local: bool,
    ) -> Result<DatasetRecord, DepotError> {
        if is_local {
            return self
                .local
                .get(id)?
                .ok_or_else(|| DepotError::NotFound(id.to_string()));
        }

        let manifest = self.load_manifest().await?;
        let entry = manifest
            .entry(id)
            .ok_or_else(|| DepotError::NotInCatalog(id.to_string()))?;

        if entry.download_url.is_none() {
            // Offline manifest: only previously-mirrored datasets are usable.
            return self
                .mirror
                .get(id)?
                .ok_or_else(|| DepotError::OfflineNoDownload(id.to_string()));
        }

        if self.mirror.is_cached(id, &entry.version, entry.timestamp) {
            // A read that misses here raced a deletion; fall through and
            // re-download instead of failing.
            if let Some(record) = self.mirror.get(id)? {
                tracing::debug!(id = %id, "serving dataset from mirror cache");
                return Ok(record);
            }
        }

        tracing::info!(id = %id, version = entry.version, "downloading dataset from release channel");
        let bundle = self.channel.fetch_bundle(entry).await?;
        let record = DatasetRecord::mirrored(entry, &bundle);
        self.mirror.put(&record, &bundle.assets)?;
        Ok(record)
    }

    /// Load every discovered dataset's metadata concurrently. A dataset that
    /// fails to load is logged and omitted; but when every dataset failed
    /// and none of the failures was a plain "not found", the first such
    /// error is re-thrown as a systemic failure.
    pub async fn load_all_metadata(
        self: Arc<Self>,
    ) -> Result<HashMap<DatasetId, DatasetMetadata>, DepotError> {
        let discovered = self.discover().await?;
        let mut tasks = JoinSet::new();
        for dataset in discovered {
            let depot = self.clone();
            tasks.spawn(async move {
                let result = depot.resolve_record(&dataset.id, dataset.is_local).await;
                (dataset.id, result)
            });
        }

        let mut loaded = HashMap::new();
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(error = %err, "metadata load task failed to join");
                    continue;
                }
            };
            match result {
                Ok(record) => {
                    loaded.insert(id, record.metadata);
                }
                Err(err) => {
                    tracing::warn!(id = %id, error = %err, "dataset omitted from batch load");
                    errors.push(err);
                }
            }
        }

        if loaded.is_empty()
            && !errors.is_empty()
            && errors.iter().all(|err| !err.is_not_found())
        {
            return Err(errors.remove(0));
        }
        Ok(loaded)
    }

    /// Validate and store a user-supplied archive. Returns the id the
    /// dataset was imported under, which carries the conflict suffix when
    /// the declared id collides with a catalog id.
    pub async fn import_archive(&self, archive_bytes: &[u8]) -> Result<DatasetId, DepotError> {
        let reserved = self.reserved_ids().await;
        let bundle = bundle::parse(archive_bytes, &reserved)?;
        self.store_import(&bundle)
    }

    fn store_import(&self, bundle: &ParsedBundle) -> Result<DatasetId, DepotError> {
        // Re-import replaces the dataset wholesale; handles minted against
        // the old payloads must not outlive it.
        if self.local.is_cached(&bundle.dataset_id) {
            self.urls.release_all(&bundle.dataset_id)?;
        }
        let record = DatasetRecord::imported(bundle);
        self.local.put(&record, &bundle.assets)?;
        tracing::info!(id = %bundle.dataset_id, units = bundle.index.units.len(), "imported dataset");
        Ok(bundle.dataset_id.clone())
    }

    /// Built-in ids a user import may not shadow. Best effort while offline:
    /// with no manifest and no snapshot, imports proceed unrestricted.
    async fn reserved_ids(&self) -> HashSet<DatasetId> {
        match self.load_manifest().await {
            Ok(manifest) => manifest.ids().into_iter().collect(),
            Err(err) => {
                tracing::warn!(error = %err, "importing without catalog id list");
                HashSet::new()
            }
        }
    }

    /// Remove a dataset from whichever store owns it, revoking every live
    /// handle under its id first.
    pub fn delete_dataset(&self, id: &DatasetId) -> Result<(), DepotError> {
        let in_local = self.local.is_cached(id);
        let in_mirror = self.mirror.get(id)?.is_some();
        if !in_local && !in_mirror {
            return Err(DepotError::NotFound(id.to_string()));
        }

        self.urls.release_all(id)?;
        if in_local {
            self.local.delete(id)?;
        }
        if in_mirror {
            self.mirror.delete(id)?;
        }
        Ok(())
    }

    /// Whether a user import owns this id. Imports shadow remote datasets
    /// with the same id for direct lookups.
    pub fn has_local(&self, id: &DatasetId) -> bool {
        self.local.is_cached(id)
    }

    pub fn acquire_asset_url(
        &self,
        id: &DatasetId,
        asset_path: &str,
    ) -> Result<Option<String>, DepotError> {
        self.urls.acquire(id, asset_path, self.local.is_cached(id))
    }

    pub fn release_asset_url(&self, id: &DatasetId, asset_path: &str) -> Result<(), DepotError> {
        self.urls.release(id, asset_path)
    }

    /// Force a manifest re-fetch and prune mirrored datasets that dropped
    /// out of the catalog.
    pub async fn refresh_catalog(&self) -> Result<Arc<CatalogManifest>, DepotError> {
        self.manifest.invalidate();
        self.load_manifest().await
    }

    async fn load_manifest(&self) -> Result<Arc<CatalogManifest>, DepotError> {
        let manifest = self.manifest.load().await?;
        if self.manifest.take_prune_pending() {
            let current: HashSet<DatasetId> = manifest.ids().into_iter().collect();
            for id in self.mirror.prune_stale(&current)? {
                self.urls.release_all(&id)?;
            }
        }
        Ok(manifest)
    }
}

/// Build a depot from resolved configuration. The config decides the data
/// source mode once, at startup; everything downstream of the channel is
/// identical in both modes.
pub fn build_depot(
    config: &crate::config::ResolvedConfig,
    runtime: Arc<dyn BlobRuntime>,
) -> Result<Depot, DepotError> {
    use crate::channel::{HttpReleaseChannel, StaticDirChannel};
    use crate::config::DataSourceMode;

    let channel: Arc<dyn ReleaseChannel> = match &config.data_source {
        DataSourceMode::RemoteManifest { manifest_url } => {
            Arc::new(HttpReleaseChannel::new(manifest_url.clone())?)
        }
        DataSourceMode::LocalStaticFiles { dir } => Arc::new(StaticDirChannel::new(dir.clone())),
    };
    Ok(Depot::new(
        LocalStore::open(config.local_root.clone()),
        MirrorCache::open(config.mirror_root.clone()),
        channel,
        runtime,
    ))
}
