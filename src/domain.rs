use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

const DRAFT: &str = "draft";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DandisetId(String);

impl DandisetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DandisetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DandisetId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().trim_start_matches("DANDI:");
        let is_valid =
            normalized.len() == 6 && normalized.chars().all(|ch| ch.is_ascii_digit());
        if !is_valid {
            return Err(SyncError::InvalidDandisetId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for DandisetId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DandisetId> for String {
    fn from(id: DandisetId) -> Self {
        id.0
    }
}

/// Either the mutable `draft` tag or an immutable published version such as `0.230915.1841`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetVersion(String);

impl DatasetVersion {
    pub fn draft() -> Self {
        Self(DRAFT.to_string())
    }

    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_draft(&self) -> bool {
        self.0 == DRAFT
    }
}

impl fmt::Display for DatasetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub id: DandisetId,
    pub version: DatasetVersion,
    pub name: String,
    pub created_at: String,
    pub modified_at: String,
    pub asset_count: u64,
    pub total_size: u64,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub embargo_status: Option<String>,
    #[serde(default)]
    pub star_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub entries: Vec<CollectionEntry>,
    #[serde(default = "epoch")]
    pub fetched_at: DateTime<Utc>,
}

impl CollectionSnapshot {
    pub fn sorted_entries(&self) -> Vec<CollectionEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub size: u64,
    pub asset_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    #[serde(flatten)]
    pub entry: CollectionEntry,
    #[serde(default)]
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default = "epoch")]
    pub fetched_at: DateTime<Utc>,
}

impl DatasetRecord {
    /// A record written by an interrupted run has no usable metadata.
    pub fn has_metadata(&self) -> bool {
        match &self.metadata {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedObject {
    pub path: String,
    pub type_tag: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectInfo {
    pub age: Option<Value>,
    pub genotype: Option<Value>,
    pub sex: Option<Value>,
    pub species: Option<Value>,
    pub subject_id: Option<Value>,
    pub strain: Option<Value>,
    pub specimen_name: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub dataset_id: DandisetId,
    pub asset_id: String,
    pub typed_objects: Vec<TypedObject>,
    pub session_description: Option<Value>,
    pub subject: SubjectInfo,
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn entry(id: &str) -> CollectionEntry {
        CollectionEntry {
            id: id.parse().unwrap(),
            version: DatasetVersion::draft(),
            name: format!("dandiset {id}"),
            created_at: "2023-01-01T00:00:00Z".to_string(),
            modified_at: "2023-01-02T00:00:00Z".to_string(),
            asset_count: 1,
            total_size: 10,
            contact: None,
            embargo_status: Some("OPEN".to_string()),
            star_count: 0,
        }
    }

    #[test]
    fn parse_dandiset_id_strips_prefix() {
        let id: DandisetId = "DANDI:000003".parse().unwrap();
        assert_eq!(id.as_str(), "000003");
    }

    #[test]
    fn parse_dandiset_id_invalid() {
        let err = "12ab".parse::<DandisetId>().unwrap_err();
        assert_matches!(err, SyncError::InvalidDandisetId(_));
    }

    #[test]
    fn draft_detection() {
        assert!(DatasetVersion::draft().is_draft());
        assert!(!DatasetVersion::new("0.230915.1841").is_draft());
    }

    #[test]
    fn snapshot_sorts_by_id() {
        let snapshot = CollectionSnapshot {
            entries: vec![entry("000409"), entry("000003"), entry("000026")],
            fetched_at: epoch(),
        };
        let ids = snapshot
            .sorted_entries()
            .into_iter()
            .map(|entry| entry.id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["000003", "000026", "000409"]);
    }

    #[test]
    fn dataset_record_missing_timestamp_defaults_to_epoch() {
        let json = serde_json::json!({
            "id": "000003",
            "version": "draft",
            "name": "x",
            "created_at": "c",
            "modified_at": "m",
            "asset_count": 0,
            "total_size": 0,
            "metadata": null
        });
        let record: DatasetRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.fetched_at, epoch());
        assert!(!record.has_metadata());
        assert!(record.files.is_empty());
    }

    #[test]
    fn empty_metadata_object_counts_as_missing() {
        let mut record = DatasetRecord {
            entry: entry("000003"),
            files: Vec::new(),
            metadata: Some(serde_json::json!({})),
            fetched_at: epoch(),
        };
        assert!(!record.has_metadata());
        record.metadata = Some(serde_json::json!({"id": "DANDI:000003/draft"}));
        assert!(record.has_metadata());
    }
}
