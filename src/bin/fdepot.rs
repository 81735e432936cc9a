use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use faction_depot::app::{Depot, build_depot};
use faction_depot::config::ConfigLoader;
use faction_depot::domain::{DatasetId, DiscoveredDataset};
use faction_depot::error::DepotError;
use faction_depot::handles::InMemoryBlobRuntime;
use faction_depot::output::JsonOutput;

#[derive(Parser)]
#[command(name = "fdepot")]
#[command(about = "Faction dataset manager: versioned remote mirror plus local archive imports")]
#[command(version, author)]
struct Cli {
    /// Path to the config file (defaults to ./fdepot.json).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List every available dataset, local and remote")]
    Catalog,
    #[command(about = "Re-fetch the manifest and prune stale mirrored datasets")]
    Refresh,
    #[command(about = "Resolve a dataset, downloading and caching if stale")]
    Fetch(IdArgs),
    #[command(about = "Load metadata for every available dataset")]
    FetchAll,
    #[command(about = "Import a dataset archive (zip)")]
    Import(ImportArgs),
    #[command(about = "Show a dataset's metadata and unit count")]
    Show(IdArgs),
    #[command(about = "Delete a dataset and revoke its asset handles")]
    Remove(IdArgs),
    #[command(about = "Resolve one asset and print its handle url")]
    Asset(AssetArgs),
}

#[derive(Args)]
struct IdArgs {
    id: String,
}

#[derive(Args)]
struct ImportArgs {
    archive: String,
}

#[derive(Args)]
struct AssetArgs {
    id: String,
    path: String,
}

#[derive(Serialize)]
struct CatalogOutput {
    datasets: Vec<DiscoveredDataset>,
}

#[derive(Serialize)]
struct RefreshOutput {
    release_tag: String,
    generated_at: String,
    entries: usize,
}

#[derive(Serialize)]
struct FetchOutput {
    id: String,
    display_name: String,
    version: Option<String>,
    units: usize,
}

#[derive(Serialize)]
struct FetchAllOutput {
    loaded: Vec<FetchAllEntry>,
}

#[derive(Serialize)]
struct FetchAllEntry {
    id: String,
    display_name: String,
}

#[derive(Serialize)]
struct ImportOutput {
    id: String,
    units: usize,
}

#[derive(Serialize)]
struct RemoveOutput {
    id: String,
    removed: bool,
}

#[derive(Serialize)]
struct AssetOutput {
    id: String,
    path: String,
    url: String,
    size_bytes: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(depot) = report.downcast_ref::<DepotError>() {
            return ExitCode::from(map_exit_code(depot));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DepotError) -> u8 {
    if error.is_not_found() {
        return 2;
    }
    if error.is_network() {
        return 3;
    }
    match error {
        DepotError::MissingConfig | DepotError::ConfigRead(_) | DepotError::ConfigParse(_) => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let runtime = Arc::new(InMemoryBlobRuntime::new());
    let depot = Arc::new(build_depot(&config, runtime.clone())?);

    match cli.command {
        Commands::Catalog => {
            let datasets = depot.discover().await?;
            JsonOutput::print(&CatalogOutput { datasets }).into_diagnostic()?;
        }
        Commands::Refresh => {
            let manifest = depot.refresh_catalog().await?;
            JsonOutput::print(&RefreshOutput {
                release_tag: manifest.release_tag.clone(),
                generated_at: manifest.generated_at.clone(),
                entries: manifest.entries.len(),
            })
            .into_diagnostic()?;
        }
        Commands::Fetch(args) => {
            let id: DatasetId = args.id.parse()?;
            let is_local = local_first(&depot, &id);
            let record = depot.resolve_record(&id, is_local).await?;
            JsonOutput::print(&FetchOutput {
                id: id.to_string(),
                display_name: record.metadata.display_name,
                version: record.version,
                units: record.index.units.len(),
            })
            .into_diagnostic()?;
        }
        Commands::FetchAll => {
            let loaded = depot.clone().load_all_metadata().await?;
            let mut entries: Vec<FetchAllEntry> = loaded
                .into_iter()
                .map(|(id, metadata)| FetchAllEntry {
                    id: id.to_string(),
                    display_name: metadata.display_name,
                })
                .collect();
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            JsonOutput::print(&FetchAllOutput { loaded: entries }).into_diagnostic()?;
        }
        Commands::Import(args) => {
            let bytes = std::fs::read(&args.archive)
                .map_err(|err| DepotError::Filesystem(format!("read {}: {err}", args.archive)))?;
            let id = depot.import_archive(&bytes).await?;
            let record = depot.resolve_record(&id, true).await?;
            JsonOutput::print(&ImportOutput {
                id: id.to_string(),
                units: record.index.units.len(),
            })
            .into_diagnostic()?;
        }
        Commands::Show(args) => {
            let id: DatasetId = args.id.parse()?;
            let is_local = local_first(&depot, &id);
            let record = depot.resolve_record(&id, is_local).await?;
            JsonOutput::print(&record).into_diagnostic()?;
        }
        Commands::Remove(args) => {
            let id: DatasetId = args.id.parse()?;
            depot.delete_dataset(&id)?;
            JsonOutput::print(&RemoveOutput {
                id: id.to_string(),
                removed: true,
            })
            .into_diagnostic()?;
        }
        Commands::Asset(args) => {
            let id: DatasetId = args.id.parse()?;
            let url = depot
                .acquire_asset_url(&id, &args.path)?
                .ok_or_else(|| DepotError::AssetNotFound(format!("{id}/{}", args.path)))?;
            let size_bytes = runtime.resolve(&url).map(|bytes| bytes.len()).unwrap_or(0);
            JsonOutput::print(&AssetOutput {
                id: id.to_string(),
                path: args.path.clone(),
                url,
                size_bytes,
            })
            .into_diagnostic()?;
            depot.release_asset_url(&id, &args.path)?;
        }
    }
    Ok(())
}

fn local_first(depot: &Depot, id: &DatasetId) -> bool {
    // Imports shadow same-named remote datasets for direct lookups.
    depot.has_local(id)
}
