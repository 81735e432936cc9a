use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::DatasetId;
use crate::error::DepotError;
use crate::store::{LocalStore, MirrorCache};

/// Runtime that mints and revokes ephemeral handles for binary payloads.
/// The manager guarantees revoke is called exactly once per live handle, at
/// the 1 -> 0 refcount transition; implementations may treat a revoke of an
/// unknown url as a double-free.
pub trait BlobRuntime: Send + Sync {
    fn create_url(&self, key: &str, bytes: Vec<u8>) -> String;
    fn revoke_url(&self, url: &str) -> Result<(), DepotError>;
}

/// Default runtime: payloads held in memory behind `blob:fdepot/<n>` urls.
#[derive(Default)]
pub struct InMemoryBlobRuntime {
    next: AtomicU64,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload behind a live url, for consumers that render the binary.
    pub fn resolve(&self, url: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(url).cloned()
    }
}

impl BlobRuntime for InMemoryBlobRuntime {
    fn create_url(&self, _key: &str, bytes: Vec<u8>) -> String {
        let url = format!("blob:fdepot/{}", self.next.fetch_add(1, Ordering::Relaxed));
        self.blobs.lock().unwrap().insert(url.clone(), bytes);
        url
    }

    fn revoke_url(&self, url: &str) -> Result<(), DepotError> {
        match self.blobs.lock().unwrap().remove(url) {
            Some(_) => Ok(()),
            None => Err(DepotError::ReferenceLeak(url.to_string())),
        }
    }
}

struct CachedHandle {
    url: String,
    ref_count: u32,
}

/// Reference-counted map from `datasetId/assetPath` to a revocable handle.
///
/// A handle exists in the map iff its refcount is at least 1, and the
/// underlying resource is returned to the runtime exactly once, when the
/// count reaches zero. Every mutation happens under one synchronous lock;
/// there is no await point between the refcount check and its update, so
/// concurrent acquire/release pairs cannot lose updates or double-revoke.
pub struct AssetUrlManager {
    local: Arc<LocalStore>,
    mirror: Arc<MirrorCache>,
    runtime: Arc<dyn BlobRuntime>,
    handles: Mutex<HashMap<String, CachedHandle>>,
}

impl AssetUrlManager {
    pub fn new(
        local: Arc<LocalStore>,
        mirror: Arc<MirrorCache>,
        runtime: Arc<dyn BlobRuntime>,
    ) -> Self {
        Self {
            local,
            mirror,
            runtime,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn key(id: &DatasetId, asset_path: &str) -> String {
        format!("{id}/{asset_path}")
    }

    /// Returns a handle for the asset, or `None` if the owning store has no
    /// such asset. Repeated acquisitions of one key share a single handle.
    pub fn acquire(
        &self,
        id: &DatasetId,
        asset_path: &str,
        is_local: bool,
    ) -> Result<Option<String>, DepotError> {
        let key = Self::key(id, asset_path);
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.get_mut(&key) {
            handle.ref_count += 1;
            return Ok(Some(handle.url.clone()));
        }

        // Resolved under the lock: a racing acquire for the same key must
        // never mint a second handle while one is live.
        let bytes = if is_local {
            self.local.get_asset(id, asset_path)?
        } else {
            self.mirror.get_asset(id, asset_path)?
        };
        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let url = self.runtime.create_url(&key, bytes);
        handles.insert(
            key,
            CachedHandle {
                url: url.clone(),
                ref_count: 1,
            },
        );
        Ok(Some(url))
    }

    /// Decrements the refcount; revokes and removes the handle at zero.
    /// A release with no matching entry is a no-op: consumers torn down out
    /// of order may double-release, and that must not poison live handles.
    pub fn release(&self, id: &DatasetId, asset_path: &str) -> Result<(), DepotError> {
        let key = Self::key(id, asset_path);
        let mut handles = self.handles.lock().unwrap();
        match handles.get_mut(&key) {
            None => {
                tracing::warn!(key, "release without matching acquire");
                Ok(())
            }
            Some(handle) if handle.ref_count > 1 => {
                handle.ref_count -= 1;
                Ok(())
            }
            Some(_) => {
                let handle = handles.remove(&key).unwrap();
                self.runtime.revoke_url(&handle.url)
            }
        }
    }

    /// Revokes every handle under the dataset's key prefix, ignoring
    /// refcounts. Used when the dataset itself is evicted; handles must not
    /// survive their owning dataset.
    pub fn release_all(&self, id: &DatasetId) -> Result<(), DepotError> {
        let prefix = format!("{id}/");
        let mut handles = self.handles.lock().unwrap();
        let keys: Vec<String> = handles
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        let mut first_err = None;
        for key in keys {
            let handle = handles.remove(&key).unwrap();
            if let Err(err) = self.runtime.revoke_url(&handle.url) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn live_handle_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}
