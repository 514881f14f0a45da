use std::process::ExitCode;

use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use dandi_mirror::catalog::DandiHttpClient;
use dandi_mirror::config::ConfigLoader;
use dandi_mirror::error::SyncError;
use dandi_mirror::output::JsonOutput;
use dandi_mirror::reader::{AssetUrls, HttpFileReader};
use dandi_mirror::store::FsCacheStore;
use dandi_mirror::sync::Synchronizer;

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::CatalogHttp(_) | SyncError::CatalogStatus { .. } => 3,
        SyncError::SchemaMismatch { .. }
        | SyncError::MissingVersion(_)
        | SyncError::InvalidDandisetId(_) => 4,
        SyncError::OpenAsset { .. } => 5,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ConfigLoader::resolve(None)?;
    let store = FsCacheStore::new(config.data_root.clone());
    store.ensure_root()?;

    let catalog = DandiHttpClient::new(&config.api_base_url, config.http_timeout)?;
    let reader = HttpFileReader::new(config.http_timeout)?;
    let urls = AssetUrls::new(&config.api_base_url, &config.lindi_base_url);

    let synchronizer = Synchronizer::new(catalog, reader, store, urls, config.policy);
    let report = synchronizer.run()?;
    JsonOutput::print_report(&report).into_diagnostic()?;
    Ok(())
}
