use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Variants carry string payloads only so the enum stays `Clone`; the
/// manifest loader broadcasts a settled `Result` to every caller that joined
/// an in-flight round, which requires the error to be shareable.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum DepotError {
    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("dataset not found: {0}")]
    NotFound(String),

    #[error("asset not found: {0}")]
    AssetNotFound(String),

    #[error("dataset not listed in catalog: {0}")]
    NotInCatalog(String),

    #[error("manifest request failed: {0}")]
    ManifestHttp(String),

    #[error("manifest fetch returned status {status}: {message}")]
    ManifestStatus { status: u16, message: String },

    #[error("archive download failed: {0}")]
    DownloadHttp(String),

    #[error("archive download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("dataset {0} has no download url in the offline manifest")]
    OfflineNoDownload(String),

    #[error("no manifest available: network unreachable and no cached snapshot")]
    NoManifest,

    #[error("archive is missing required file: {0}")]
    ArchiveMissingFile(String),

    #[error("archive file {file} is not valid JSON: {message}")]
    ArchiveInvalidJson { file: String, message: String },

    #[error("archive failed validation: {0}")]
    ArchiveValidation(String),

    #[error("archive extraction failed: {0}")]
    ArchiveExtraction(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("release without matching acquire for {0}")]
    ReferenceLeak(String),

    #[error("missing config file fdepot.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl DepotError {
    /// True for the variants that mean "the thing is simply absent", which
    /// batch loads swallow per item instead of aborting the whole batch.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DepotError::NotFound(_) | DepotError::AssetNotFound(_) | DepotError::NotInCatalog(_)
        )
    }

    /// True when the failure came from the network leg, so callers can show
    /// connectivity-specific messaging instead of a generic error.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            DepotError::ManifestHttp(_)
                | DepotError::ManifestStatus { .. }
                | DepotError::DownloadHttp(_)
                | DepotError::DownloadStatus { .. }
                | DepotError::OfflineNoDownload(_)
                | DepotError::NoManifest
        )
    }
}
