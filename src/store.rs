use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::Builder;

use crate::domain::{AssetRecord, CollectionSnapshot, DandisetId, DatasetRecord};
use crate::error::SyncError;

/// Persistence for the three cache levels. Presence of a record (and its
/// `fetched_at`) is the only state the synchronizer consults between runs.
pub trait CacheStore {
    fn collection(&self) -> Result<Option<CollectionSnapshot>, SyncError>;
    fn put_collection(&self, snapshot: &CollectionSnapshot) -> Result<(), SyncError>;

    fn dataset(&self, id: &DandisetId) -> Result<Option<DatasetRecord>, SyncError>;
    fn put_dataset(&self, record: &DatasetRecord) -> Result<(), SyncError>;

    fn has_asset(
        &self,
        id: &DandisetId,
        generation: &str,
        asset_id: &str,
    ) -> Result<bool, SyncError>;
    fn put_asset(&self, generation: &str, record: &AssetRecord) -> Result<(), SyncError>;

    /// Removes a whole asset generation for one dandiset. Returns the number of
    /// records removed, or `None` when the generation was not present.
    fn delete_generation(
        &self,
        id: &DandisetId,
        generation: &str,
    ) -> Result<Option<usize>, SyncError>;
}

#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: Utf8PathBuf,
}

impl FsCacheStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn collection_path(&self) -> Utf8PathBuf {
        self.root.join("dandi.json")
    }

    pub fn dataset_dir(&self, id: &DandisetId) -> Utf8PathBuf {
        self.root.join("dandisets").join(id.as_str())
    }

    pub fn dataset_path(&self, id: &DandisetId) -> Utf8PathBuf {
        self.dataset_dir(id).join("dataset.json")
    }

    pub fn asset_dir(&self, id: &DandisetId, generation: &str) -> Utf8PathBuf {
        self.dataset_dir(id).join(format!("assets.{generation}"))
    }

    pub fn asset_path(&self, id: &DandisetId, generation: &str, asset_id: &str) -> Utf8PathBuf {
        self.asset_dir(id, generation).join(format!("{asset_id}.json"))
    }

    pub fn ensure_root(&self) -> Result<(), SyncError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, SyncError> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("read {path}: {err}")))?;
        let value = serde_json::from_str(&content)
            .map_err(|err| SyncError::Filesystem(format!("parse {path}: {err}")))?;
        Ok(Some(value))
    }

    fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), SyncError> {
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".dandi-mirror")
            .suffix(".tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

impl CacheStore for FsCacheStore {
    fn collection(&self) -> Result<Option<CollectionSnapshot>, SyncError> {
        Self::read_json(&self.collection_path())
    }

    fn put_collection(&self, snapshot: &CollectionSnapshot) -> Result<(), SyncError> {
        Self::write_json(&self.collection_path(), snapshot)
    }

    fn dataset(&self, id: &DandisetId) -> Result<Option<DatasetRecord>, SyncError> {
        Self::read_json(&self.dataset_path(id))
    }

    fn put_dataset(&self, record: &DatasetRecord) -> Result<(), SyncError> {
        Self::write_json(&self.dataset_path(&record.entry.id), record)
    }

    fn has_asset(
        &self,
        id: &DandisetId,
        generation: &str,
        asset_id: &str,
    ) -> Result<bool, SyncError> {
        Ok(self
            .asset_path(id, generation, asset_id)
            .as_std_path()
            .is_file())
    }

    fn put_asset(&self, generation: &str, record: &AssetRecord) -> Result<(), SyncError> {
        let path = self.asset_path(&record.dataset_id, generation, &record.asset_id);
        Self::write_json(&path, record)
    }

    fn delete_generation(
        &self,
        id: &DandisetId,
        generation: &str,
    ) -> Result<Option<usize>, SyncError> {
        let dir = self.asset_dir(id, generation);
        if !dir.as_std_path().is_dir() {
            return Ok(None);
        }
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut removed = 0usize;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
                removed += 1;
            }
        }
        fs::remove_dir_all(dir.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("remove {dir}: {err}")))?;
        Ok(Some(removed))
    }
}
