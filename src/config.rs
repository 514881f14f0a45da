use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const CONFIG_FILE: &str = "dandi-sync.json";
pub const CONFIG_ENV: &str = "DANDI_SYNC_CONFIG";

pub const DEFAULT_API_BASE_URL: &str = "https://api.dandiarchive.org/api";
pub const DEFAULT_LINDI_BASE_URL: &str = "https://lindi.neurosift.org";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub lindi_base_url: Option<String>,
    #[serde(default)]
    pub collection_ttl_secs: Option<u64>,
    #[serde(default)]
    pub dataset_ttl_secs: Option<u64>,
    #[serde(default)]
    pub asset_budget_secs: Option<u64>,
    #[serde(default)]
    pub max_assets_per_dataset: Option<usize>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
}

/// Staleness thresholds and bounds applied by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub collection_ttl: Duration,
    pub dataset_ttl: Duration,
    pub asset_budget: Duration,
    pub max_assets_per_dataset: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            collection_ttl: Duration::from_secs(60 * 60),
            dataset_ttl: Duration::from_secs(60 * 60 * 24),
            asset_budget: Duration::from_secs(15),
            max_assets_per_dataset: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_root: Utf8PathBuf,
    pub api_base_url: String,
    pub lindi_base_url: String,
    pub http_timeout: Duration,
    pub policy: SyncPolicy,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, else `$DANDI_SYNC_CONFIG`, else `dandi-sync.json` if present.
    /// Without any file every setting takes its default.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let explicit = path
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_ENV).ok().filter(|value| !value.trim().is_empty()));
        let config_path = match &explicit {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if explicit.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let defaults = SyncPolicy::default();
        let policy = SyncPolicy {
            collection_ttl: config
                .collection_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.collection_ttl),
            dataset_ttl: config
                .dataset_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.dataset_ttl),
            asset_budget: config
                .asset_budget_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.asset_budget),
            max_assets_per_dataset: config
                .max_assets_per_dataset
                .unwrap_or(defaults.max_assets_per_dataset),
        };

        let data_root = config.data_root.unwrap_or_else(|| "data".to_string());
        if data_root.trim().is_empty() {
            return Err(SyncError::ConfigParse("data_root must not be empty".to_string()));
        }

        Ok(ResolvedConfig {
            data_root: Utf8PathBuf::from(data_root),
            api_base_url: trim_base(config.api_base_url, DEFAULT_API_BASE_URL),
            lindi_base_url: trim_base(config.lindi_base_url, DEFAULT_LINDI_BASE_URL),
            http_timeout: Duration::from_secs(config.http_timeout_secs.unwrap_or(60)),
            policy,
        })
    }
}

fn trim_base(value: Option<String>, default: &str) -> String {
    value
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_sync_policy() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.data_root, Utf8PathBuf::from("data"));
        assert_eq!(resolved.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(resolved.policy.collection_ttl, Duration::from_secs(3600));
        assert_eq!(resolved.policy.dataset_ttl, Duration::from_secs(86400));
        assert_eq!(resolved.policy.asset_budget, Duration::from_secs(15));
        assert_eq!(resolved.policy.max_assets_per_dataset, 20);
    }

    #[test]
    fn overrides_and_trailing_slashes() {
        let config: Config = serde_json::from_str(
            r#"{"data_root": "/srv/mirror", "api_base_url": "http://localhost:8000/api/", "asset_budget_secs": 5}"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.data_root, Utf8PathBuf::from("/srv/mirror"));
        assert_eq!(resolved.api_base_url, "http://localhost:8000/api");
        assert_eq!(resolved.policy.asset_budget, Duration::from_secs(5));
        assert_eq!(resolved.policy.max_assets_per_dataset, 20);
    }
}
