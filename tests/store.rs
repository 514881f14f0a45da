use std::fs;

use camino::Utf8PathBuf;
use chrono::Utc;
use serde_json::{Value, json};

use dandi_mirror::catalog::{CatalogClient, expected_metadata_id};
use dandi_mirror::config::SyncPolicy;
use dandi_mirror::domain::{
    AssetRecord, CollectionEntry, CollectionSnapshot, DandisetId, DatasetRecord, DatasetVersion,
    FileRef,
};
use dandi_mirror::error::SyncError;
use dandi_mirror::generation::CURRENT_GENERATION;
use dandi_mirror::lindi;
use dandi_mirror::reader::{AssetUrls, FileReader};
use dandi_mirror::store::{CacheStore, FsCacheStore};
use dandi_mirror::sync::{CollectionAction, Synchronizer};
use dandi_mirror::tree::NodeTree;

fn temp_store() -> (tempfile::TempDir, FsCacheStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap();
    let store = FsCacheStore::new(root);
    store.ensure_root().unwrap();
    (temp, store)
}

fn draft_entry() -> CollectionEntry {
    CollectionEntry {
        id: "000003".parse().unwrap(),
        version: DatasetVersion::draft(),
        name: "Physiological properties of hippocampal neurons".to_string(),
        created_at: "2020-03-15T22:56:55.655000Z".to_string(),
        modified_at: "2023-06-01T00:00:00Z".to_string(),
        asset_count: 25,
        total_size: 2_559_248_010_229,
        contact: Some("Doe, Jane".to_string()),
        embargo_status: Some("OPEN".to_string()),
        star_count: 4,
    }
}

fn lindi_index() -> Value {
    json!({
        "refs": {
            ".zgroup": {"zarr_format": 2},
            ".zattrs": {"neurodata_type": "NWBFile"},
            "acquisition/.zgroup": {"zarr_format": 2},
            "acquisition/lfp/.zgroup": {"zarr_format": 2},
            "acquisition/lfp/.zattrs": {"neurodata_type": "LFP", "description": "local field"},
            "processing/.zgroup": {"zarr_format": 2},
            "processing/ecephys/.zgroup": {"zarr_format": 2},
            "processing/ecephys/.zattrs": {"neurodata_type": "ProcessingModule"},
            "processing/ecephys/raw/.zgroup": {"zarr_format": 2},
            "processing/ecephys/raw/.zattrs": {"_SOFT_LINK": {"path": "/acquisition/lfp"}},
            "session_description/.zarray": {"shape": [], "dtype": "|O", "compressor": null},
            "session_description/.zattrs": {"_SCALAR": true},
            "session_description/0": "[\"linear track\",\"|O\",[1]]",
            "general/.zgroup": {"zarr_format": 2},
            "general/subject/.zgroup": {"zarr_format": 2},
            "general/subject/species/.zarray": {"shape": [], "dtype": "|O", "compressor": null},
            "general/subject/species/0": "[\"Rattus norvegicus\",\"|O\",[1]]",
            "general/subject/age/.zarray": {"shape": [], "dtype": "|O", "compressor": null},
            "general/subject/age/0": "[\"P60D\",\"|O\",[1]]"
        }
    })
}

struct StaticCatalog {
    entries: Vec<CollectionEntry>,
    files: Vec<FileRef>,
}

impl CatalogClient for StaticCatalog {
    fn list_collection(&self) -> Result<Vec<CollectionEntry>, SyncError> {
        Ok(self.entries.clone())
    }

    fn list_files(
        &self,
        _id: &DandisetId,
        _version: &DatasetVersion,
    ) -> Result<Vec<FileRef>, SyncError> {
        Ok(self.files.clone())
    }

    fn fetch_metadata(
        &self,
        id: &DandisetId,
        version: &DatasetVersion,
    ) -> Result<Value, SyncError> {
        Ok(json!({"id": expected_metadata_id(id, version), "schemaVersion": "0.6.4"}))
    }
}

struct LindiReader;

impl FileReader for LindiReader {
    fn open_remote_index(&self, _url: &str) -> Result<NodeTree, SyncError> {
        lindi::tree_from_index(&lindi_index())
    }

    fn open_direct(&self, url: &str) -> Result<NodeTree, SyncError> {
        Err(SyncError::DirectAccess(url.to_string()))
    }
}

#[test]
fn missing_records_read_as_absent() {
    let (_temp, store) = temp_store();
    let id: DandisetId = "000003".parse().unwrap();
    assert!(store.collection().unwrap().is_none());
    assert!(store.dataset(&id).unwrap().is_none());
    assert!(!store.has_asset(&id, CURRENT_GENERATION, "abc").unwrap());
    assert_eq!(store.delete_generation(&id, "v6").unwrap(), None);
}

#[test]
fn records_round_trip_through_disk() {
    let (_temp, store) = temp_store();
    let snapshot = CollectionSnapshot {
        entries: vec![draft_entry()],
        fetched_at: Utc::now(),
    };
    store.put_collection(&snapshot).unwrap();
    assert_eq!(store.collection().unwrap().unwrap(), snapshot);

    let record = DatasetRecord {
        entry: draft_entry(),
        files: vec![FileRef {
            path: "sub-01/sub-01.nwb".to_string(),
            size: 10,
            asset_id: "a1".to_string(),
        }],
        metadata: Some(json!({"id": "DANDI:000003/draft"})),
        fetched_at: Utc::now(),
    };
    store.put_dataset(&record).unwrap();
    assert_eq!(store.dataset(&record.entry.id).unwrap().unwrap(), record);

    let raw: Value =
        serde_json::from_str(&fs::read_to_string(store.dataset_path(&record.entry.id)).unwrap())
            .unwrap();
    assert_eq!(raw["id"], "000003");
    assert_eq!(raw["files"][0]["asset_id"], "a1");
}

#[test]
fn delete_generation_removes_whole_directory() {
    let (_temp, store) = temp_store();
    let id: DandisetId = "000003".parse().unwrap();
    let record = AssetRecord {
        dataset_id: id.clone(),
        asset_id: "a1".to_string(),
        typed_objects: Vec::new(),
        session_description: None,
        subject: Default::default(),
    };
    store.put_asset("v6", &record).unwrap();
    store
        .put_asset("v6", &AssetRecord {
            asset_id: "a2".to_string(),
            ..record.clone()
        })
        .unwrap();
    store.put_asset(CURRENT_GENERATION, &record).unwrap();

    assert_eq!(store.delete_generation(&id, "v6").unwrap(), Some(2));
    assert!(!store.asset_dir(&id, "v6").as_std_path().exists());
    assert!(store.has_asset(&id, CURRENT_GENERATION, "a1").unwrap());
}

#[test]
fn full_run_on_empty_cache_writes_all_levels() {
    let (_temp, store) = temp_store();
    let id: DandisetId = "000003".parse().unwrap();
    let legacy = store.asset_dir(&id, "v5");
    fs::create_dir_all(legacy.as_std_path()).unwrap();
    fs::write(legacy.join("old.json").as_std_path(), b"{}").unwrap();

    let files = (0..3)
        .map(|idx| FileRef {
            path: format!("sub-{idx}/sub-{idx}_ecephys.nwb"),
            size: 100,
            asset_id: format!("asset-{idx}"),
        })
        .collect::<Vec<_>>();
    let catalog = StaticCatalog {
        entries: vec![draft_entry()],
        files,
    };
    let urls = AssetUrls::new("https://api.example.org/api", "https://lindi.example.org");
    let sync = Synchronizer::new(catalog, LindiReader, store, urls, SyncPolicy::default());

    let report = sync.run().unwrap();

    assert_eq!(report.collection, CollectionAction::Refreshed);
    assert_eq!(report.dandisets[0].assets_loaded, 3);
    assert_eq!(report.dandisets[0].generations_purged, vec!["v5".to_string()]);
    assert!(!legacy.as_std_path().exists());

    let store = sync.store();
    assert!(store.dataset(&id).unwrap().unwrap().has_metadata());
    let asset_dir = store.asset_dir(&id, CURRENT_GENERATION);
    let asset_files = fs::read_dir(asset_dir.as_std_path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect::<Vec<_>>();
    assert_eq!(asset_files.len(), 3);

    let content = fs::read_to_string(store.asset_path(&id, CURRENT_GENERATION, "asset-1")).unwrap();
    let asset: AssetRecord = serde_json::from_str(&content).unwrap();
    let paths = asset
        .typed_objects
        .iter()
        .map(|obj| obj.path.as_str())
        .collect::<Vec<_>>();
    assert_eq!(paths, vec!["/acquisition/lfp", "/processing/ecephys"]);
    assert_eq!(asset.session_description, Some(json!("linear track")));
    assert_eq!(asset.subject.species, Some(json!("Rattus norvegicus")));
    assert_eq!(asset.subject.age, Some(json!("P60D")));
    assert_eq!(asset.subject.strain, None);

    let second = sync.run().unwrap();
    assert_eq!(second.collection, CollectionAction::Cached);
    assert_eq!(second.dandisets[0].assets_cached, 3);
    assert_eq!(second.dandisets[0].assets_loaded, 0);
}
