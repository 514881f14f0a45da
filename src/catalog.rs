use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;

use crate::domain::{CollectionEntry, DandisetId, DatasetVersion, FileRef};
use crate::error::SyncError;

pub const NWB_GLOB: &str = "*.nwb";

pub trait CatalogClient {
    fn list_collection(&self) -> Result<Vec<CollectionEntry>, SyncError>;
    fn list_files(
        &self,
        id: &DandisetId,
        version: &DatasetVersion,
    ) -> Result<Vec<FileRef>, SyncError>;
    fn fetch_metadata(&self, id: &DandisetId, version: &DatasetVersion)
    -> Result<Value, SyncError>;
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RawDandiset {
    identifier: String,
    #[serde(default)]
    most_recent_published_version: Option<RawVersion>,
    #[serde(default)]
    draft_version: Option<RawVersion>,
    #[serde(default)]
    contact_person: Option<String>,
    #[serde(default)]
    embargo_status: Option<String>,
    #[serde(default)]
    star_count: u64,
}

#[derive(Debug, Deserialize)]
struct RawVersion {
    version: String,
    name: String,
    created: String,
    modified: String,
    asset_count: u64,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct RawAsset {
    asset_id: String,
    path: String,
    size: u64,
}

#[derive(Clone)]
pub struct DandiHttpClient {
    client: Client,
    base_url: String,
}

impl DandiHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("dandi-mirror/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn collection_url(&self) -> String {
        format!(
            "{}/dandisets/?page=1&page_size=5000&ordering=-modified&draft=true&empty=false&embargoed=false",
            self.base_url
        )
    }

    pub fn files_url(&self, id: &DandisetId, version: &DatasetVersion) -> String {
        format!(
            "{}/dandisets/{}/versions/{}/assets/?page_size=100&glob={}",
            self.base_url, id, version, NWB_GLOB
        )
    }

    pub fn metadata_url(&self, id: &DandisetId, version: &DatasetVersion) -> String {
        format!("{}/dandisets/{}/versions/{}/", self.base_url, id, version)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, SyncError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| SyncError::CatalogHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| SyncError::CatalogHttp(err.to_string()))
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "DANDI request failed".to_string());
        Err(SyncError::CatalogStatus { status, message })
    }
}

impl CatalogClient for DandiHttpClient {
    fn list_collection(&self) -> Result<Vec<CollectionEntry>, SyncError> {
        let page: Page<RawDandiset> = self.get_json(&self.collection_url())?;
        page.results.into_iter().map(collection_entry).collect()
    }

    fn list_files(
        &self,
        id: &DandisetId,
        version: &DatasetVersion,
    ) -> Result<Vec<FileRef>, SyncError> {
        let page: Page<RawAsset> = self.get_json(&self.files_url(id, version))?;
        Ok(page
            .results
            .into_iter()
            .map(|asset| FileRef {
                path: asset.path,
                size: asset.size,
                asset_id: asset.asset_id,
            })
            .collect())
    }

    fn fetch_metadata(
        &self,
        id: &DandisetId,
        version: &DatasetVersion,
    ) -> Result<Value, SyncError> {
        let metadata: Value = self.get_json(&self.metadata_url(id, version))?;
        validate_metadata_id(&metadata, id, version)?;
        Ok(metadata)
    }
}

/// Published versions take precedence over the draft.
fn collection_entry(raw: RawDandiset) -> Result<CollectionEntry, SyncError> {
    let version = raw
        .most_recent_published_version
        .or(raw.draft_version)
        .ok_or_else(|| SyncError::MissingVersion(raw.identifier.clone()))?;
    Ok(CollectionEntry {
        id: raw.identifier.parse()?,
        version: DatasetVersion::new(version.version),
        name: version.name,
        created_at: version.created,
        modified_at: version.modified,
        asset_count: version.asset_count,
        total_size: version.size,
        contact: raw.contact_person,
        embargo_status: raw.embargo_status,
        star_count: raw.star_count,
    })
}

pub fn expected_metadata_id(id: &DandisetId, version: &DatasetVersion) -> String {
    format!("DANDI:{id}/{version}")
}

pub fn validate_metadata_id(
    metadata: &Value,
    id: &DandisetId,
    version: &DatasetVersion,
) -> Result<(), SyncError> {
    let expected = expected_metadata_id(id, version);
    let actual = metadata
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if actual != expected {
        return Err(SyncError::SchemaMismatch {
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(())
}
