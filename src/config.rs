use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::CellStoreError;

/// Environment variable naming the object-store bucket.
pub const BUCKET_ENV: &str = "S3_BUCKET_URI";

const DEFAULT_CONFIG: &str = "cellstore.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub local_root: Option<String>,
    #[serde(default)]
    pub remote_prefix: Option<String>,
    #[serde(default)]
    pub force_remote: Option<bool>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub query_timeout_ms: Option<u64>,
    #[serde(default)]
    pub workers: Option<WorkersEntry>,
    #[serde(default)]
    pub compaction: Option<CompactionEntry>,
    #[serde(default)]
    pub backfill: Option<BackfillEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WorkersEntry {
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CompactionEntry {
    #[serde(default)]
    pub delete_invalid_fragments: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BackfillEntry {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackfillCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub local_root: Utf8PathBuf,
    pub remote_prefix: String,
    pub bucket: Option<String>,
    pub force_remote: bool,
    pub cache_dir: Utf8PathBuf,
    pub query_timeout: Option<Duration>,
    pub worker_threads: usize,
    pub queue_capacity: usize,
    pub delete_invalid_fragments: bool,
    pub backfill: Option<BackfillCommand>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `cellstore.json` (or `path`) and resolves it against the environment.
    /// Without an explicit path a missing default file yields built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CellStoreError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| CellStoreError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| CellStoreError::ConfigParse(err.to_string()))?
        };

        let bucket = std::env::var(BUCKET_ENV).ok();
        Self::resolve_config(config, bucket.as_deref())
    }

    pub fn resolve_config(
        config: Config,
        bucket_uri: Option<&str>,
    ) -> Result<ResolvedConfig, CellStoreError> {
        let workers = config.workers.unwrap_or_default();
        let compaction = config.compaction.unwrap_or_default();

        let cache_dir = match config.cache_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_cache_dir(),
        };

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            local_root: Utf8PathBuf::from(
                config.local_root.unwrap_or_else(|| "DataWarehouse".to_string()),
            ),
            remote_prefix: config
                .remote_prefix
                .unwrap_or_else(|| "DataWarehouse".to_string())
                .trim_matches('/')
                .to_string(),
            bucket: bucket_uri.and_then(parse_bucket),
            force_remote: config.force_remote.unwrap_or(false),
            cache_dir,
            query_timeout: config.query_timeout_ms.map(Duration::from_millis),
            worker_threads: workers.threads.unwrap_or(2).max(1),
            queue_capacity: workers.queue_capacity.unwrap_or(16).max(1),
            delete_invalid_fragments: compaction.delete_invalid_fragments.unwrap_or(true),
            backfill: config.backfill.map(|entry| BackfillCommand {
                program: PathBuf::from(entry.program),
                args: entry.args,
            }),
        })
    }
}

/// Reduces `s3://bucket/some/path` to `bucket`; a bare name is returned as-is.
pub fn parse_bucket(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let rest = trimmed.strip_prefix("s3://").unwrap_or(trimmed);
    let bucket = rest.split('/').next().unwrap_or_default();
    (!bucket.is_empty()).then(|| bucket.to_string())
}

fn default_cache_dir() -> Utf8PathBuf {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.cache_dir().join("cellstore")).ok()
        })
        .unwrap_or_else(|| Utf8PathBuf::from(".cellstore-cache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default(), None).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.local_root, "DataWarehouse");
        assert_eq!(resolved.remote_prefix, "DataWarehouse");
        assert!(resolved.bucket.is_none());
        assert!(!resolved.force_remote);
        assert_eq!(resolved.worker_threads, 2);
        assert!(resolved.delete_invalid_fragments);
        assert!(resolved.backfill.is_none());
    }

    #[test]
    fn bucket_from_uri() {
        assert_eq!(parse_bucket("s3://lab-data/warehouse"), Some("lab-data".to_string()));
        assert_eq!(parse_bucket("lab-data"), Some("lab-data".to_string()));
        assert_eq!(parse_bucket("s3://"), None);
    }
}
