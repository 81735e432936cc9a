use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};

use serde_json::Value;
use zip::ZipArchive;

use crate::domain::{DatasetId, DatasetIndex, DatasetMetadata, ParsedBundle};
use crate::error::DepotError;
use crate::sanitize::sanitize_metadata;

const METADATA_FILE: &str = "metadata.json";
const INDEX_FILE: &str = "units.json";
const ASSETS_PREFIX: &str = "assets/";

/// Validate and extract a user-supplied archive.
///
/// Accepts both archive conventions: `metadata.json`/`units.json` at the
/// archive root, or nested one level inside a single top-level folder.
/// `reserved_ids` are the built-in catalog ids; a bundle that declares one of
/// them is deterministically renamed with the fixed conflict suffix.
pub fn parse(
    archive_bytes: &[u8],
    reserved_ids: &HashSet<DatasetId>,
) -> Result<ParsedBundle, DepotError> {
    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))
        .map_err(|err| DepotError::ArchiveExtraction(err.to_string()))?;

    let names: Vec<String> = archive.file_names().map(|name| name.to_string()).collect();
    let prefix = locate_bundle_root(&names)?;

    let metadata_raw = read_entry(&mut archive, &format!("{prefix}{METADATA_FILE}"))?;
    let index_raw = read_entry(&mut archive, &format!("{prefix}{INDEX_FILE}"))?;

    let metadata_value = parse_json(METADATA_FILE, &metadata_raw)?;
    let index_value = parse_json(INDEX_FILE, &index_raw)?;

    let mut metadata = validate_metadata(&metadata_value)?;
    let index = validate_index(&index_value)?;
    sanitize_metadata(&mut metadata);

    let declared: DatasetId = metadata
        .identifier
        .parse()
        .map_err(|_| {
            DepotError::ArchiveValidation(format!(
                "metadata.json field `identifier` is not a usable dataset id: {:?}",
                metadata.identifier
            ))
        })?;
    let dataset_id = if reserved_ids.contains(&declared) {
        let renamed = declared.with_conflict_suffix();
        tracing::info!(declared = %declared, renamed = %renamed, "import id collides with a built-in dataset");
        renamed
    } else {
        declared
    };
    metadata.identifier = dataset_id.as_str().to_string();

    let mut assets = BTreeMap::new();
    let asset_root = format!("{prefix}{ASSETS_PREFIX}");
    for name in &names {
        if !name.starts_with(&asset_root) || name.ends_with('/') {
            continue;
        }
        let relative = name[asset_root.len()..].to_string();
        if relative.is_empty() {
            continue;
        }
        let mut entry = archive
            .by_name(name)
            .map_err(|err| DepotError::ArchiveExtraction(err.to_string()))?;
        if entry.enclosed_name().is_none() {
            return Err(DepotError::ArchiveExtraction(format!(
                "zip entry path traversal detected: {name}"
            )));
        }
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|err| DepotError::ArchiveExtraction(err.to_string()))?;
        assets.insert(relative, bytes);
    }

    Ok(ParsedBundle {
        dataset_id,
        metadata,
        index,
        assets,
    })
}

/// Returns the path prefix under which the bundle files live: `""` for flat
/// archives, `"<folder>/"` when everything sits inside one top-level folder.
fn locate_bundle_root(names: &[String]) -> Result<String, DepotError> {
    if names.iter().any(|name| name == METADATA_FILE) {
        if !names.iter().any(|name| name == INDEX_FILE) {
            return Err(DepotError::ArchiveMissingFile(INDEX_FILE.to_string()));
        }
        return Ok(String::new());
    }

    let top_level: HashSet<&str> = names
        .iter()
        .filter_map(|name| name.split('/').next())
        .filter(|part| !part.is_empty())
        .collect();
    if top_level.len() == 1 {
        let folder = top_level.into_iter().next().unwrap();
        let prefix = format!("{folder}/");
        if !names.iter().any(|name| *name == format!("{prefix}{METADATA_FILE}")) {
            return Err(DepotError::ArchiveMissingFile(METADATA_FILE.to_string()));
        }
        if !names.iter().any(|name| *name == format!("{prefix}{INDEX_FILE}")) {
            return Err(DepotError::ArchiveMissingFile(INDEX_FILE.to_string()));
        }
        return Ok(prefix);
    }

    Err(DepotError::ArchiveMissingFile(METADATA_FILE.to_string()))
}

fn read_entry(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<String, DepotError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|err| DepotError::ArchiveExtraction(format!("read {name}: {err}")))?;
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|err| DepotError::ArchiveExtraction(format!("read {name}: {err}")))?;
    Ok(content)
}

pub(crate) fn parse_json(file: &str, content: &str) -> Result<Value, DepotError> {
    serde_json::from_str(content).map_err(|err| DepotError::ArchiveInvalidJson {
        file: file.to_string(),
        message: err.to_string(),
    })
}

pub(crate) fn validate_metadata(value: &Value) -> Result<DatasetMetadata, DepotError> {
    for field in ["identifier", "displayName", "version", "type"] {
        let present = value
            .get(field)
            .and_then(Value::as_str)
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false);
        if !present {
            return Err(DepotError::ArchiveValidation(format!(
                "metadata.json is missing required field `{field}`"
            )));
        }
    }
    serde_json::from_value(value.clone())
        .map_err(|err| DepotError::ArchiveValidation(format!("metadata.json: {err}")))
}

pub(crate) fn validate_index(value: &Value) -> Result<DatasetIndex, DepotError> {
    match value.get("units") {
        Some(Value::Array(_)) => serde_json::from_value(value.clone())
            .map_err(|err| DepotError::ArchiveValidation(format!("units.json: {err}"))),
        Some(_) => Err(DepotError::ArchiveValidation(
            "units.json field `units` must be an array".to_string(),
        )),
        None => Err(DepotError::ArchiveValidation(
            "units.json is missing required field `units`".to_string(),
        )),
    }
}
