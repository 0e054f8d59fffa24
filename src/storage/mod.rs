//! Uniform object access over the local filesystem or a remote object store.
//!
//! Domain code (catalog, planner, executor, compactor) only ever talks to a
//! [`StorageBackend`]; which concrete store backs a dataset is decided once by
//! the [`StorageResolver`].

pub mod local;
pub mod parquet_io;
pub mod remote;

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use tracing::debug;

use crate::error::CellStoreError;
use crate::layout::Locator;

pub use local::LocalStore;
pub use parquet_io::ColumnPredicate;
pub use remote::RemoteStore;

pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Short label for logs and results (`local`, `remote`).
    fn kind(&self) -> &'static str;

    fn exists(&self, locator: &Locator) -> Result<bool, CellStoreError>;

    /// Every object whose locator starts with `prefix`, sorted.
    fn list_fragments(&self, prefix: &Locator) -> Result<Vec<Locator>, CellStoreError>;

    fn read_schema(&self, locator: &Locator) -> Result<SchemaRef, CellStoreError>;

    fn read_table(
        &self,
        locator: &Locator,
        columns: &[String],
        predicates: &[ColumnPredicate],
    ) -> Result<RecordBatch, CellStoreError>;

    /// Writes a complete Parquet object; readers never observe a partial write.
    fn write_table(&self, batch: &RecordBatch, locator: &Locator) -> Result<(), CellStoreError>;

    /// Moves `source` over `target`. Readers see the old or the new object, never a mix.
    fn replace(&self, source: &Locator, target: &Locator) -> Result<(), CellStoreError>;

    fn delete(&self, locator: &Locator) -> Result<(), CellStoreError>;

    fn read_bytes(&self, locator: &Locator) -> Result<Bytes, CellStoreError>;
}

/// Picks the backend for a dataset: the local copy when it exists (and remote
/// is not forced), the object store otherwise.
#[derive(Debug, Clone)]
pub struct StorageResolver {
    local: Arc<dyn StorageBackend>,
    remote: Option<Arc<dyn StorageBackend>>,
    force_remote: bool,
}

impl StorageResolver {
    pub fn new(
        local: Arc<dyn StorageBackend>,
        remote: Option<Arc<dyn StorageBackend>>,
        force_remote: bool,
    ) -> Self {
        Self {
            local,
            remote,
            force_remote,
        }
    }

    pub fn local_only(local: Arc<dyn StorageBackend>) -> Self {
        Self::new(local, None, false)
    }

    pub fn local(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.local)
    }

    /// `probe` is the object whose local presence decides the backend
    /// (the core fragment for fragment reads, the JSON file for side metadata).
    pub fn resolve(
        &self,
        probe: &Locator,
        force_remote: bool,
    ) -> Result<Arc<dyn StorageBackend>, CellStoreError> {
        let forced = self.force_remote || force_remote;
        if !forced && self.local.exists(probe)? {
            debug!(locator = %probe, "resolved to local storage");
            return Ok(Arc::clone(&self.local));
        }
        match &self.remote {
            Some(remote) => {
                debug!(locator = %probe, "resolved to remote storage");
                Ok(Arc::clone(remote))
            }
            None if forced => Err(CellStoreError::MissingBucket),
            None => Err(CellStoreError::NotFound(probe.to_string())),
        }
    }
}
