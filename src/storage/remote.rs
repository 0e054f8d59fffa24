use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

use super::StorageBackend;
use super::parquet_io::{self, ColumnPredicate};
use crate::error::CellStoreError;
use crate::layout::Locator;

/// Identity of one stored object revision; a cached copy is reused only
/// while the remote object still reports the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObjectVersion {
    e_tag: Option<String>,
    last_modified: DateTime<Utc>,
    size: u64,
}

impl From<&ObjectMeta> for ObjectVersion {
    fn from(meta: &ObjectMeta) -> Self {
        Self {
            e_tag: meta.e_tag.clone(),
            last_modified: meta.last_modified,
            size: meta.size,
        }
    }
}

#[derive(Debug)]
struct Materialized {
    version: ObjectVersion,
    file: Arc<NamedTempFile>,
}

/// Object-store backed warehouse. Parquet objects are downloaded once into a
/// local scratch file which the columnar reader then opens like any other file.
#[derive(Debug)]
pub struct RemoteStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    runtime: Runtime,
    cache_dir: Utf8PathBuf,
    materialized: Mutex<HashMap<Locator, Materialized>>,
}

impl RemoteStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        cache_dir: Utf8PathBuf,
    ) -> Result<Self, CellStoreError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| CellStoreError::BackendUnavailable(err.to_string()))?;
        Ok(Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            runtime,
            cache_dir,
            materialized: Mutex::new(HashMap::new()),
        })
    }

    /// S3 store for `bucket`; credentials come from the standard AWS environment.
    pub fn s3(
        bucket: &str,
        prefix: impl Into<String>,
        cache_dir: Utf8PathBuf,
    ) -> Result<Self, CellStoreError> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|err| CellStoreError::BackendUnavailable(err.to_string()))?;
        info!(bucket, "configured remote object store");
        Self::new(Arc::new(store), prefix, cache_dir)
    }

    fn object_path(&self, locator: &Locator) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(locator.as_str())
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, locator.as_str()))
        }
    }

    fn to_locator(&self, path: &ObjectPath) -> Locator {
        let raw = path.as_ref();
        let relative = if self.prefix.is_empty() {
            raw
        } else {
            raw.strip_prefix(self.prefix.as_str())
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(raw)
        };
        Locator::new(relative)
    }

    fn head(&self, locator: &Locator) -> Result<ObjectMeta, CellStoreError> {
        let path = self.object_path(locator);
        self.runtime
            .block_on(self.store.head(&path))
            .map_err(|err| map_store(locator, err))
    }

    fn forget(&self, locator: &Locator) {
        self.materialized.lock().remove(locator);
    }

    /// Local scratch copy of a remote object, refreshed when the object changes.
    fn materialize(&self, locator: &Locator) -> Result<File, CellStoreError> {
        let version = ObjectVersion::from(&self.head(locator)?);
        if let Some(cached) = self.materialized.lock().get(locator) {
            if cached.version == version {
                debug!(locator = %locator, "reusing materialized copy");
                return cached
                    .file
                    .reopen()
                    .map_err(|err| CellStoreError::Filesystem(err.to_string()));
            }
        }

        let bytes = self.read_bytes(locator)?;
        fs::create_dir_all(self.cache_dir.as_std_path())
            .map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("cellstore-")
            .suffix(".parquet")
            .tempfile_in(self.cache_dir.as_std_path())
            .map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
        temp.write_all(&bytes)
            .and_then(|_| temp.flush())
            .map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
        debug!(locator = %locator, bytes = bytes.len(), "materialized remote object");

        let file = temp
            .reopen()
            .map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
        self.materialized.lock().insert(
            locator.clone(),
            Materialized {
                version,
                file: Arc::new(temp),
            },
        );
        Ok(file)
    }
}

impl StorageBackend for RemoteStore {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn exists(&self, locator: &Locator) -> Result<bool, CellStoreError> {
        match self.head(locator) {
            Ok(_) => Ok(true),
            Err(CellStoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn list_fragments(&self, prefix: &Locator) -> Result<Vec<Locator>, CellStoreError> {
        let dir = self.object_path(&Locator::new(prefix.parent()));
        let metas: Vec<ObjectMeta> = self
            .runtime
            .block_on(self.store.list(Some(&dir)).try_collect())
            .map_err(|err| map_store(prefix, err))?;
        let mut found = metas
            .iter()
            .map(|meta| self.to_locator(&meta.location))
            .filter(|locator| {
                locator.parent() == prefix.parent()
                    && locator.file_name().starts_with(prefix.file_name())
            })
            .collect::<Vec<_>>();
        found.sort();
        Ok(found)
    }

    fn read_schema(&self, locator: &Locator) -> Result<SchemaRef, CellStoreError> {
        parquet_io::read_schema(self.materialize(locator)?, locator)
    }

    fn read_table(
        &self,
        locator: &Locator,
        columns: &[String],
        predicates: &[ColumnPredicate],
    ) -> Result<RecordBatch, CellStoreError> {
        parquet_io::read_table(self.materialize(locator)?, locator, columns, predicates)
    }

    fn write_table(&self, batch: &RecordBatch, locator: &Locator) -> Result<(), CellStoreError> {
        let payload = PutPayload::from(parquet_io::to_bytes(batch)?);
        let path = self.object_path(locator);
        self.runtime
            .block_on(self.store.put(&path, payload))
            .map_err(|err| map_store(locator, err))?;
        self.forget(locator);
        Ok(())
    }

    fn replace(&self, source: &Locator, target: &Locator) -> Result<(), CellStoreError> {
        // Object overwrite is atomic: a GET returns either the old or the new body.
        let from = self.object_path(source);
        let to = self.object_path(target);
        self.runtime
            .block_on(self.store.rename(&from, &to))
            .map_err(|err| map_store(source, err))?;
        self.forget(source);
        self.forget(target);
        Ok(())
    }

    fn delete(&self, locator: &Locator) -> Result<(), CellStoreError> {
        if !self.exists(locator)? {
            return Err(CellStoreError::NotFound(locator.to_string()));
        }
        let path = self.object_path(locator);
        self.runtime
            .block_on(self.store.delete(&path))
            .map_err(|err| map_store(locator, err))?;
        self.forget(locator);
        Ok(())
    }

    fn read_bytes(&self, locator: &Locator) -> Result<Bytes, CellStoreError> {
        let path = self.object_path(locator);
        self.runtime
            .block_on(async {
                let result = self.store.get(&path).await?;
                result.bytes().await
            })
            .map_err(|err| map_store(locator, err))
    }
}

fn map_store(locator: &Locator, err: object_store::Error) -> CellStoreError {
    match err {
        object_store::Error::NotFound { .. } => CellStoreError::NotFound(locator.to_string()),
        other => CellStoreError::BackendUnavailable(format!("{locator}: {other}")),
    }
}
