use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::channel::ReleaseChannel;
use crate::domain::{CatalogManifest, ManifestSnapshot};
use crate::error::DepotError;
use crate::store::MirrorCache;

type RoundResult = Result<Arc<CatalogManifest>, DepotError>;

enum LoadState {
    Idle,
    /// A fetch round is outstanding; late callers subscribe and receive the
    /// fetcher's settled result.
    Loading(broadcast::Sender<RoundResult>),
    Ready(Arc<CatalogManifest>),
}

/// Session-scoped catalog manifest loader.
///
/// The first `load` call performs the network fetch; every call issued while
/// that fetch is outstanding joins the same round and observes the same
/// settled value, success or failure. After a success the manifest is
/// memoized until `invalidate`. A network failure falls back to the mirror's
/// stored snapshot; with no snapshot either, the load fails with
/// [`DepotError::NoManifest`], which callers surface as "catalog unreachable"
/// rather than an empty catalog.
pub struct ManifestLoader {
    channel: Arc<dyn ReleaseChannel>,
    mirror: Arc<MirrorCache>,
    state: Mutex<LoadState>,
    prune_pending: AtomicBool,
}

impl ManifestLoader {
    pub fn new(channel: Arc<dyn ReleaseChannel>, mirror: Arc<MirrorCache>) -> Self {
        Self {
            channel,
            mirror,
            state: Mutex::new(LoadState::Idle),
            prune_pending: AtomicBool::new(false),
        }
    }

    pub async fn load(&self) -> RoundResult {
        enum Role {
            Fetch(broadcast::Sender<RoundResult>),
            Wait(broadcast::Receiver<RoundResult>),
        }

        let role = {
            let mut state = self.state.lock().unwrap();
            match &*state {
                LoadState::Ready(manifest) => return Ok(manifest.clone()),
                LoadState::Loading(tx) => Role::Wait(tx.subscribe()),
                LoadState::Idle => {
                    let (tx, _) = broadcast::channel(1);
                    *state = LoadState::Loading(tx.clone());
                    Role::Fetch(tx)
                }
            }
        };

        match role {
            Role::Wait(mut rx) => match rx.recv().await {
                Ok(result) => result,
                // The fetcher was dropped before its round settled.
                Err(_) => Err(DepotError::ManifestHttp(
                    "manifest fetch was cancelled".to_string(),
                )),
            },
            Role::Fetch(tx) => {
                let guard = RoundGuard { loader: self };
                let result = self.fetch_round().await;
                std::mem::forget(guard);

                let mut state = self.state.lock().unwrap();
                *state = match &result {
                    Ok(manifest) => LoadState::Ready(manifest.clone()),
                    Err(_) => LoadState::Idle,
                };
                // Settle every waiter; no receivers is fine.
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    /// Drop the memoized manifest so the next `load` fetches again.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(&*state, LoadState::Ready(_)) {
            *state = LoadState::Idle;
        }
    }

    /// True once after each successful network fetch: the signal that the
    /// mirror should be pruned against the fresh id list.
    pub fn take_prune_pending(&self) -> bool {
        self.prune_pending.swap(false, Ordering::AcqRel)
    }

    async fn fetch_round(&self) -> RoundResult {
        match self.channel.fetch_manifest().await {
            Ok(manifest) => {
                self.mirror.write_snapshot(&ManifestSnapshot::of(&manifest))?;
                self.prune_pending.store(true, Ordering::Release);
                Ok(Arc::new(manifest))
            }
            Err(err) if err.is_network() => {
                tracing::warn!(error = %err, "manifest fetch failed, trying stored snapshot");
                match self.mirror.read_snapshot()? {
                    Some(snapshot) => Ok(Arc::new(snapshot.to_manifest())),
                    None => Err(DepotError::NoManifest),
                }
            }
            Err(err) => Err(err),
        }
    }
}

/// Resets an outstanding round if the fetcher's future is dropped before it
/// settles, so waiters fail fast and a later `load` starts a new round.
struct RoundGuard<'a> {
    loader: &'a ManifestLoader,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.loader.state.lock().unwrap();
        if matches!(&*state, LoadState::Loading(_)) {
            *state = LoadState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::{ManifestEntry, ManifestSource, ParsedBundle};

    struct MockChannel {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockChannel {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReleaseChannel for MockChannel {
        async fn fetch_manifest(&self) -> Result<CatalogManifest, DepotError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Yield so that callers which joined the round get polled while
            // this fetch is still outstanding.
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            if self.fail {
                return Err(DepotError::ManifestHttp("connection refused".to_string()));
            }
            Ok(CatalogManifest {
                generated_at: "2026-01-01T00:00:00Z".to_string(),
                release_tag: "2026.1".to_string(),
                entries: vec![ManifestEntry {
                    id: "iron-legion".parse().unwrap(),
                    version: "3".to_string(),
                    download_url: Some("https://example.test/iron-legion.zip".to_string()),
                    size_bytes: None,
                    timestamp: 77,
                    display_name: None,
                    is_addon: None,
                    base_dataset_ids: None,
                }],
                source: ManifestSource::Network,
            })
        }

        async fn fetch_bundle(&self, _entry: &ManifestEntry) -> Result<ParsedBundle, DepotError> {
            unreachable!("manifest tests never fetch bundles")
        }
    }

    fn mirror_in(dir: &std::path::Path) -> Arc<MirrorCache> {
        Arc::new(MirrorCache::open(
            Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap(),
        ))
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_fetch() {
        let temp = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::ok());
        let loader = ManifestLoader::new(channel.clone(), mirror_in(temp.path()));

        let (a, b, c) = tokio::join!(loader.load(), loader.load(), loader.load());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(channel.calls(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
    }

    #[tokio::test]
    async fn success_is_memoized_until_invalidate() {
        let temp = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::ok());
        let loader = ManifestLoader::new(channel.clone(), mirror_in(temp.path()));

        let first = loader.load().await.unwrap();
        let second = loader.load().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(channel.calls(), 1);

        loader.invalidate();
        loader.load().await.unwrap();
        assert_eq!(channel.calls(), 2);
    }

    #[tokio::test]
    async fn network_success_writes_snapshot_and_flags_prune() {
        let temp = tempfile::tempdir().unwrap();
        let mirror = mirror_in(temp.path());
        let loader = ManifestLoader::new(Arc::new(MockChannel::ok()), mirror.clone());

        loader.load().await.unwrap();
        assert!(loader.take_prune_pending());
        assert!(!loader.take_prune_pending());

        let snapshot = mirror.read_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.ids, vec!["iron-legion".parse().unwrap()]);
        assert_eq!(snapshot.release_tag, "2026.1");
    }

    #[tokio::test]
    async fn network_failure_falls_back_to_snapshot() {
        let temp = tempfile::tempdir().unwrap();
        let mirror = mirror_in(temp.path());
        mirror
            .write_snapshot(&ManifestSnapshot {
                generated_at: "2025-12-01T00:00:00Z".to_string(),
                release_tag: "2025.4".to_string(),
                ids: vec!["iron-legion".parse().unwrap()],
            })
            .unwrap();

        let loader = ManifestLoader::new(Arc::new(MockChannel::failing()), mirror);
        let manifest = loader.load().await.unwrap();
        assert_eq!(manifest.source, ManifestSource::Snapshot);
        assert_eq!(manifest.entries.len(), 1);
        assert!(manifest.entries[0].download_url.is_none());
        assert!(!loader.take_prune_pending());
    }

    #[tokio::test]
    async fn no_snapshot_means_no_manifest() {
        let temp = tempfile::tempdir().unwrap();
        let loader = ManifestLoader::new(Arc::new(MockChannel::failing()), mirror_in(temp.path()));
        assert_matches!(loader.load().await, Err(DepotError::NoManifest));
    }

    #[tokio::test]
    async fn failed_round_is_not_memoized() {
        let temp = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::failing());
        let loader = ManifestLoader::new(channel.clone(), mirror_in(temp.path()));

        let (a, b) = tokio::join!(loader.load(), loader.load());
        assert_matches!(a, Err(DepotError::NoManifest));
        assert_matches!(b, Err(DepotError::NoManifest));
        assert_eq!(channel.calls(), 1);

        // The in-flight slot was cleared, so the next call starts a new round.
        let _ = loader.load().await;
        assert_eq!(channel.calls(), 2);
    }
}
