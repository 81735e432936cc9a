use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::DepotError;

/// On-disk configuration file, `fdepot.json`.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub data_source: DataSourceConfig,
    #[serde(default)]
    pub local_root: Option<String>,
    #[serde(default)]
    pub mirror_root: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DataSourceConfig {
    /// Full manifest + download + cache pipeline.
    Remote { manifest_url: String },
    /// Same-origin static dataset directories (development convenience).
    Static { dir: String },
}

/// The single explicit switch for where data comes from, decided once at
/// startup and injected into the composition root.
#[derive(Debug, Clone)]
pub enum DataSourceMode {
    RemoteManifest { manifest_url: String },
    LocalStaticFiles { dir: Utf8PathBuf },
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub data_source: DataSourceMode,
    /// Store for user-imported datasets: project-local by default.
    pub local_root: Utf8PathBuf,
    /// Remote-mirror cache: shared per-user cache directory by default.
    pub mirror_root: Utf8PathBuf,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, DepotError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("fdepot.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(DepotError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| DepotError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| DepotError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, DepotError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let data_source = match config.data_source {
            DataSourceConfig::Remote { manifest_url } => {
                DataSourceMode::RemoteManifest { manifest_url }
            }
            DataSourceConfig::Static { dir } => DataSourceMode::LocalStaticFiles {
                dir: Utf8PathBuf::from(dir),
            },
        };

        let local_root = match config.local_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_local_root()?,
        };
        let mirror_root = match config.mirror_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_mirror_root()?,
        };

        Ok(ResolvedConfig {
            schema_version,
            data_source,
            local_root,
            mirror_root,
        })
    }
}

/// Imports live next to the project: `<cwd>/.fdepot`.
pub fn default_local_root() -> Result<Utf8PathBuf, DepotError> {
    let cwd = std::env::current_dir().map_err(|err| DepotError::Filesystem(err.to_string()))?;
    Utf8PathBuf::from_path_buf(cwd.join(".fdepot"))
        .map_err(|_| DepotError::Filesystem("invalid project path".to_string()))
}

/// The mirror cache is shared per user: `~/.cache/faction-depot`.
pub fn default_mirror_root() -> Result<Utf8PathBuf, DepotError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("faction-depot")).ok()
        })
        .ok_or_else(|| DepotError::Filesystem("unable to resolve cache directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_remote_config() {
        let config = Config {
            schema_version: None,
            data_source: DataSourceConfig::Remote {
                manifest_url: "https://releases.example.test/manifest.json".to_string(),
            },
            local_root: Some("/tmp/fdepot-test/local".to_string()),
            mirror_root: Some("/tmp/fdepot-test/mirror".to_string()),
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert!(matches!(
            resolved.data_source,
            DataSourceMode::RemoteManifest { ref manifest_url }
                if manifest_url == "https://releases.example.test/manifest.json"
        ));
        assert_eq!(resolved.local_root.as_str(), "/tmp/fdepot-test/local");
    }

    #[test]
    fn parse_static_mode_json() {
        let raw = r#"{
            "data_source": { "mode": "static", "dir": "./datasets" }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert!(matches!(
            resolved.data_source,
            DataSourceMode::LocalStaticFiles { ref dir } if dir.as_str() == "./datasets"
        ));
    }
}
