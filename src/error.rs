use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid dandiset id: {0}")]
    InvalidDandisetId(String),

    #[error("DANDI request failed: {0}")]
    CatalogHttp(String),

    #[error("DANDI returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("no version information for dandiset {0}")]
    MissingVersion(String),

    #[error("unexpected metadata id: expected {expected}, got {actual}")]
    #[diagnostic(help("the archive returned a record for a different dandiset or version"))]
    SchemaMismatch { expected: String, actual: String },

    #[error("failed to open asset {asset_id}: remote index: {remote_index}; direct: {direct}")]
    OpenAsset {
        asset_id: String,
        remote_index: String,
        direct: String,
    },

    #[error("failed to fetch LINDI index: {0}")]
    RemoteIndex(String),

    #[error("failed to parse LINDI index: {0}")]
    IndexParse(String),

    #[error("malformed HDF5 file: {0}")]
    #[diagnostic(help("only the metadata subset of HDF5 used by NWB files is read"))]
    Hdf5Format(String),

    #[error("direct access failed: {0}")]
    DirectAccess(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
