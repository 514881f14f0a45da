//! Tiered synchronization: collection index, then each dandiset record, then
//! the asset records of each dandiset. Every level decides from what is on disk
//! whether to reuse or refetch, so an interrupted run simply resumes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::CatalogClient;
use crate::config::SyncPolicy;
use crate::domain::{
    CollectionEntry, CollectionSnapshot, DandisetId, DatasetRecord, FileRef, epoch,
};
use crate::error::SyncError;
use crate::extract;
use crate::generation::{self, CURRENT_GENERATION};
use crate::reader::{AssetUrls, FileReader};
use crate::store::CacheStore;
use crate::tree::NodeTree;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionAction {
    Refreshed,
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetAction {
    Refreshed,
    Cached,
    /// Published dandiset never synced before: nothing on disk and not due.
    Untracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetAction {
    Loaded,
    Cached,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSync {
    pub action: CollectionAction,
    pub entries: Vec<CollectionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetOutcome {
    pub id: DandisetId,
    pub version: String,
    pub action: DatasetAction,
    pub generations_purged: Vec<String>,
    pub assets_loaded: usize,
    pub assets_cached: usize,
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub collection: CollectionAction,
    pub dandisets: Vec<DatasetOutcome>,
}

pub struct Synchronizer<C: CatalogClient, R: FileReader, S: CacheStore> {
    catalog: C,
    reader: R,
    store: S,
    urls: AssetUrls,
    policy: SyncPolicy,
    clock: Box<dyn Clock>,
}

impl<C: CatalogClient, R: FileReader, S: CacheStore> Synchronizer<C, R, S> {
    pub fn new(catalog: C, reader: R, store: S, urls: AssetUrls, policy: SyncPolicy) -> Self {
        Self {
            catalog,
            reader,
            store,
            urls,
            policy,
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// One full pass. The first fatal error aborts the pass; records already
    /// written stay valid for the next run.
    pub fn run(&self) -> Result<SyncReport, SyncError> {
        let collection = self.sync_collection()?;
        let mut dandisets = Vec::with_capacity(collection.entries.len());
        for entry in &collection.entries {
            dandisets.push(self.sync_dataset(entry)?);
        }
        Ok(SyncReport {
            collection: collection.action,
            dandisets,
        })
    }

    pub fn sync_collection(&self) -> Result<CollectionSync, SyncError> {
        let cached = self.store.collection()?;
        let fetched_at = cached
            .as_ref()
            .map(|snapshot| snapshot.fetched_at)
            .unwrap_or_else(epoch);

        let (action, snapshot) = match cached {
            Some(snapshot)
                if !is_older_than(fetched_at, self.clock.now(), self.policy.collection_ttl) =>
            {
                info!("skipping collection update");
                (CollectionAction::Cached, snapshot)
            }
            _ => {
                info!("updating collection");
                let entries = self.catalog.list_collection()?;
                let snapshot = CollectionSnapshot {
                    entries,
                    fetched_at: self.clock.now(),
                };
                self.store.put_collection(&snapshot)?;
                (CollectionAction::Refreshed, snapshot)
            }
        };

        Ok(CollectionSync {
            action,
            entries: snapshot.sorted_entries(),
        })
    }

    pub fn sync_dataset(&self, entry: &CollectionEntry) -> Result<DatasetOutcome, SyncError> {
        let started = self.clock.now();
        let cached = self.store.dataset(&entry.id)?;

        let (action, record) =
            if dataset_needs_refresh(entry, cached.as_ref(), started, self.policy.dataset_ttl) {
                info!(dandiset = %entry.id, "processing dandiset");
                (DatasetAction::Refreshed, Some(self.refresh_dataset(entry)?))
            } else if cached.is_some() {
                info!(dandiset = %entry.id, "skipping dandiset update");
                (DatasetAction::Cached, cached)
            } else {
                debug!(dandiset = %entry.id, version = %entry.version, "published dandiset not tracked yet");
                (DatasetAction::Untracked, None)
            };

        let mut outcome = DatasetOutcome {
            id: entry.id.clone(),
            version: entry.version.to_string(),
            action,
            generations_purged: self.purge_superseded_generations(&entry.id)?,
            assets_loaded: 0,
            assets_cached: 0,
            budget_exhausted: false,
        };

        let Some(record) = record else {
            return Ok(outcome);
        };

        let limit = self.policy.max_assets_per_dataset;
        for (idx, file) in record.files.iter().take(limit).enumerate() {
            if idx > 0 && is_older_than(started, self.clock.now(), self.policy.asset_budget) {
                warn!(dandiset = %entry.id, "time limit reached, moving to next dandiset");
                outcome.budget_exhausted = true;
                break;
            }
            match self.sync_asset(&entry.id, file)? {
                AssetAction::Loaded => outcome.assets_loaded += 1,
                AssetAction::Cached => outcome.assets_cached += 1,
            }
        }
        Ok(outcome)
    }

    pub fn sync_asset(&self, dataset_id: &DandisetId, file: &FileRef) -> Result<AssetAction, SyncError> {
        if self
            .store
            .has_asset(dataset_id, CURRENT_GENERATION, &file.asset_id)?
        {
            debug!(dandiset = %dataset_id, path = %file.path, "asset info already exists");
            return Ok(AssetAction::Cached);
        }

        info!(dandiset = %dataset_id, path = %file.path, "loading asset info");
        let tree = self.open_asset(dataset_id, &file.asset_id)?;
        let record = extract::asset_record(dataset_id, &file.asset_id, &tree);
        self.store.put_asset(CURRENT_GENERATION, &record)?;
        Ok(AssetAction::Loaded)
    }

    fn refresh_dataset(&self, entry: &CollectionEntry) -> Result<DatasetRecord, SyncError> {
        let files = self.catalog.list_files(&entry.id, &entry.version)?;
        let metadata = self.catalog.fetch_metadata(&entry.id, &entry.version)?;
        let record = DatasetRecord {
            entry: entry.clone(),
            files,
            metadata: Some(metadata),
            fetched_at: self.clock.now(),
        };
        self.store.put_dataset(&record)?;
        Ok(record)
    }

    fn purge_superseded_generations(&self, id: &DandisetId) -> Result<Vec<String>, SyncError> {
        let mut purged = Vec::new();
        for tag in generation::superseded() {
            if let Some(removed) = self.store.delete_generation(id, tag)? {
                info!(dandiset = %id, generation = tag, removed, "removed old asset info files");
                purged.push(tag.to_string());
            }
        }
        Ok(purged)
    }

    fn open_asset(&self, dataset_id: &DandisetId, asset_id: &str) -> Result<NodeTree, SyncError> {
        let index_url = self.urls.index_url(dataset_id, asset_id);
        let remote_err = match self.reader.open_remote_index(&index_url) {
            Ok(tree) => return Ok(tree),
            Err(err) => err,
        };
        warn!(url = %index_url, error = %remote_err, "failed to load LINDI index, falling back to direct access");
        self.reader
            .open_direct(&self.urls.download_url(asset_id))
            .map_err(|direct_err| SyncError::OpenAsset {
                asset_id: asset_id.to_string(),
                remote_index: remote_err.to_string(),
                direct: direct_err.to_string(),
            })
    }
}

/// Drafts refresh once older than `ttl`; any record lacking metadata refreshes
/// immediately. Published versions are never refreshed on age alone.
pub fn dataset_needs_refresh(
    entry: &CollectionEntry,
    cached: Option<&DatasetRecord>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> bool {
    let fetched_at = cached.map(|record| record.fetched_at).unwrap_or_else(epoch);
    let stale_draft = entry.version.is_draft() && is_older_than(fetched_at, now, ttl);
    let incomplete = cached.is_some_and(|record| !record.has_metadata());
    stale_draft || incomplete
}

/// Timestamps in the future count as fresh.
fn is_older_than(then: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - then).to_std().map(|age| age > limit).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::domain::DatasetVersion;

    fn entry(version: DatasetVersion) -> CollectionEntry {
        CollectionEntry {
            id: "000003".parse().unwrap(),
            version,
            name: "n".to_string(),
            created_at: "c".to_string(),
            modified_at: "m".to_string(),
            asset_count: 0,
            total_size: 0,
            contact: None,
            embargo_status: None,
            star_count: 0,
        }
    }

    fn record(entry: &CollectionEntry, fetched_at: DateTime<Utc>, complete: bool) -> DatasetRecord {
        DatasetRecord {
            entry: entry.clone(),
            files: Vec::new(),
            metadata: complete.then(|| serde_json::json!({"id": "DANDI:000003/draft"})),
            fetched_at,
        }
    }

    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn draft_without_cache_is_fetched() {
        let draft = entry(DatasetVersion::draft());
        assert!(dataset_needs_refresh(&draft, None, Utc::now(), DAY));
    }

    #[test]
    fn fresh_draft_is_reused() {
        let now = Utc::now();
        let draft = entry(DatasetVersion::draft());
        let cached = record(&draft, now - TimeDelta::hours(23), true);
        assert!(!dataset_needs_refresh(&draft, Some(&cached), now, DAY));
        let cached = record(&draft, now - TimeDelta::hours(25), true);
        assert!(dataset_needs_refresh(&draft, Some(&cached), now, DAY));
    }

    #[test]
    fn published_refreshes_only_when_incomplete() {
        let now = Utc::now();
        let published = entry(DatasetVersion::new("0.230629.1955"));
        assert!(!dataset_needs_refresh(&published, None, now, DAY));
        let old = record(&published, epoch(), true);
        assert!(!dataset_needs_refresh(&published, Some(&old), now, DAY));
        let incomplete = record(&published, now, false);
        assert!(dataset_needs_refresh(&published, Some(&incomplete), now, DAY));
    }

    #[test]
    fn future_timestamps_are_fresh() {
        let now = Utc::now();
        assert!(!is_older_than(now + TimeDelta::hours(1), now, Duration::ZERO));
        assert!(is_older_than(now - TimeDelta::seconds(2), now, Duration::from_secs(1)));
    }
}
