use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::bundle;
use crate::domain::{
    CatalogManifest, DatasetId, ManifestEntry, ManifestSource, ParsedBundle, now_rfc3339,
};
use crate::error::DepotError;
use crate::sanitize::sanitize_metadata;

/// Source of the catalog manifest and of dataset bundles.
///
/// Dropping the future returned by either method aborts the in-flight
/// network request; callers persist results only after the await resolves.
#[async_trait]
pub trait ReleaseChannel: Send + Sync {
    async fn fetch_manifest(&self) -> Result<CatalogManifest, DepotError>;
    async fn fetch_bundle(&self, entry: &ManifestEntry) -> Result<ParsedBundle, DepotError>;
}

/// Production channel: manifest and zip archives over HTTPS.
#[derive(Clone)]
pub struct HttpReleaseChannel {
    client: Client,
    manifest_url: String,
}

impl HttpReleaseChannel {
    pub fn new(manifest_url: impl Into<String>) -> Result<Self, DepotError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("fdepot/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DepotError::ManifestHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| DepotError::ManifestHttp(err.to_string()))?;
        Ok(Self {
            client,
            manifest_url: manifest_url.into(),
        })
    }

    async fn get_with_retries(&self, url: &str) -> Result<reqwest::Response, reqwest::Error> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl ReleaseChannel for HttpReleaseChannel {
    async fn fetch_manifest(&self) -> Result<CatalogManifest, DepotError> {
        let start = std::time::Instant::now();
        let response = self
            .get_with_retries(&self.manifest_url)
            .await
            .map_err(|err| DepotError::ManifestHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "manifest request failed".to_string());
            return Err(DepotError::ManifestStatus { status, message });
        }
        let manifest: CatalogManifest = response
            .json()
            .await
            .map_err(|err| DepotError::ManifestHttp(err.to_string()))?;
        tracing::debug!(
            latency_ms = start.elapsed().as_millis() as u64,
            entries = manifest.entries.len(),
            "manifest fetched"
        );
        Ok(manifest)
    }

    async fn fetch_bundle(&self, entry: &ManifestEntry) -> Result<ParsedBundle, DepotError> {
        let url = entry
            .download_url
            .as_deref()
            .ok_or_else(|| DepotError::OfflineNoDownload(entry.id.to_string()))?;

        let start = std::time::Instant::now();
        let response = self
            .get_with_retries(url)
            .await
            .map_err(|err| DepotError::DownloadHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "archive download failed".to_string());
            return Err(DepotError::DownloadStatus { status, message });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| DepotError::DownloadHttp(err.to_string()))?;
        tracing::debug!(
            id = %entry.id,
            latency_ms = start.elapsed().as_millis() as u64,
            size_bytes = bytes.len(),
            "archive downloaded"
        );

        // Release archives are trusted for id purposes: no reserved-id set.
        let bundle = bundle::parse(&bytes, &HashSet::new())?;
        if bundle.dataset_id != entry.id {
            tracing::warn!(
                declared = %bundle.dataset_id,
                expected = %entry.id,
                "archive declares a different id than its manifest entry"
            );
        }
        Ok(bundle)
    }
}

/// Development channel: datasets read from same-origin static directories,
/// unified behind the manifest pipeline with synthetic "always current"
/// entries (version `dev`, source file mtime as the timestamp).
#[derive(Debug, Clone)]
pub struct StaticDirChannel {
    root: Utf8PathBuf,
}

impl StaticDirChannel {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn dataset_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.root.join(id.as_str())
    }

    fn read_json(&self, id: &DatasetId, file: &str) -> Result<serde_json::Value, DepotError> {
        let path = self.dataset_dir(id).join(file);
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| DepotError::ArchiveMissingFile(file.to_string()))?;
        bundle::parse_json(file, &content)
    }
}

#[async_trait]
impl ReleaseChannel for StaticDirChannel {
    async fn fetch_manifest(&self) -> Result<CatalogManifest, DepotError> {
        let mut entries = Vec::new();
        let dir = fs::read_dir(self.root.as_std_path())
            .map_err(|err| DepotError::ManifestHttp(format!("static dir {}: {err}", self.root)))?;
        for item in dir {
            let item = item.map_err(|err| DepotError::ManifestHttp(err.to_string()))?;
            if !item.path().is_dir() {
                continue;
            }
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = name.parse::<DatasetId>() else {
                continue;
            };
            let metadata_path = self.dataset_dir(&id).join("metadata.json");
            if !metadata_path.as_std_path().exists() {
                continue;
            }
            entries.push(ManifestEntry {
                download_url: Some(format!("static:{}", self.dataset_dir(&id))),
                version: "dev".to_string(),
                timestamp: file_mtime_millis(metadata_path.as_std_path()),
                size_bytes: None,
                display_name: None,
                is_addon: None,
                base_dataset_ids: None,
                id,
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(CatalogManifest {
            generated_at: now_rfc3339(),
            release_tag: "dev".to_string(),
            entries,
            source: ManifestSource::StaticDir,
        })
    }

    async fn fetch_bundle(&self, entry: &ManifestEntry) -> Result<ParsedBundle, DepotError> {
        let metadata_value = self.read_json(&entry.id, "metadata.json")?;
        let index_value = self.read_json(&entry.id, "units.json")?;
        let mut metadata = bundle::validate_metadata(&metadata_value)?;
        let index = bundle::validate_index(&index_value)?;
        sanitize_metadata(&mut metadata);

        let mut assets = BTreeMap::new();
        let assets_dir = self.dataset_dir(&entry.id).join("assets");
        if assets_dir.as_std_path().exists() {
            let mut stack = vec![assets_dir.as_std_path().to_path_buf()];
            while let Some(dir) = stack.pop() {
                let items = fs::read_dir(&dir)
                    .map_err(|err| DepotError::ArchiveExtraction(err.to_string()))?;
                for item in items {
                    let item =
                        item.map_err(|err| DepotError::ArchiveExtraction(err.to_string()))?;
                    let path = item.path();
                    if path.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    let relative = path
                        .strip_prefix(assets_dir.as_std_path())
                        .map_err(|err| DepotError::ArchiveExtraction(err.to_string()))?
                        .to_string_lossy()
                        .replace('\\', "/");
                    let bytes = fs::read(&path)
                        .map_err(|err| DepotError::ArchiveExtraction(err.to_string()))?;
                    assets.insert(relative, bytes);
                }
            }
        }

        Ok(ParsedBundle {
            dataset_id: entry.id.clone(),
            metadata,
            index,
            assets,
        })
    }
}

fn file_mtime_millis(path: &std::path::Path) -> i64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_dir_synthesizes_dev_manifest() {
        let temp = tempfile::tempdir().unwrap();
        let dataset = temp.path().join("iron-legion");
        fs::create_dir_all(dataset.join("assets")).unwrap();
        fs::write(
            dataset.join("metadata.json"),
            br#"{"identifier":"iron-legion","displayName":"Iron Legion","version":"9","type":"army"}"#,
        )
        .unwrap();
        fs::write(dataset.join("units.json"), br#"{"units":[{}]}"#).unwrap();
        fs::write(dataset.join("assets").join("icon.png"), b"png").unwrap();
        // A stray file at the root must not become a manifest entry.
        fs::write(temp.path().join("README.md"), b"notes").unwrap();

        let channel = StaticDirChannel::new(
            Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap(),
        );
        let manifest = channel.fetch_manifest().await.unwrap();
        assert_eq!(manifest.release_tag, "dev");
        assert_eq!(manifest.source, ManifestSource::StaticDir);
        assert_eq!(manifest.entries.len(), 1);
        let entry = &manifest.entries[0];
        assert_eq!(entry.version, "dev");
        assert!(entry.timestamp > 0);

        let bundle = channel.fetch_bundle(entry).await.unwrap();
        assert_eq!(bundle.dataset_id.as_str(), "iron-legion");
        assert_eq!(bundle.index.units.len(), 1);
        assert_eq!(bundle.assets.get("icon.png"), Some(&b"png".to_vec()));
    }

    #[tokio::test]
    async fn static_dir_missing_index_reports_file() {
        let temp = tempfile::tempdir().unwrap();
        let dataset = temp.path().join("iron-legion");
        fs::create_dir_all(&dataset).unwrap();
        fs::write(
            dataset.join("metadata.json"),
            br#"{"identifier":"iron-legion","displayName":"x","version":"1","type":"army"}"#,
        )
        .unwrap();

        let channel = StaticDirChannel::new(
            Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap(),
        );
        let manifest = channel.fetch_manifest().await.unwrap();
        let err = channel.fetch_bundle(&manifest.entries[0]).await.unwrap_err();
        assert!(matches!(err, DepotError::ArchiveMissingFile(file) if file == "units.json"));
    }
}
