use std::fs::{self, File};
use std::io::{self, BufWriter, Write};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use super::StorageBackend;
use super::parquet_io::{self, ColumnPredicate};
use crate::error::CellStoreError;
use crate::layout::Locator;

/// Warehouse rooted at a local directory (`DataWarehouse/` by default).
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: Utf8PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path(&self, locator: &Locator) -> Utf8PathBuf {
        self.root.join(locator.as_str())
    }

    fn open(&self, locator: &Locator) -> Result<File, CellStoreError> {
        File::open(self.path(locator).as_std_path()).map_err(|err| map_io(locator, err))
    }
}

impl StorageBackend for LocalStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn exists(&self, locator: &Locator) -> Result<bool, CellStoreError> {
        Ok(self.path(locator).as_std_path().is_file())
    }

    fn list_fragments(&self, prefix: &Locator) -> Result<Vec<Locator>, CellStoreError> {
        let dir = self.root.join(prefix.parent());
        if !dir.as_std_path().is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| CellStoreError::Filesystem(format!("list {dir}: {err}")))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
            if !entry.path().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(prefix.file_name()) {
                found.push(Locator::join(prefix.parent(), &name));
            }
        }
        found.sort();
        Ok(found)
    }

    fn read_schema(&self, locator: &Locator) -> Result<SchemaRef, CellStoreError> {
        parquet_io::read_schema(self.open(locator)?, locator)
    }

    fn read_table(
        &self,
        locator: &Locator,
        columns: &[String],
        predicates: &[ColumnPredicate],
    ) -> Result<RecordBatch, CellStoreError> {
        parquet_io::read_table(self.open(locator)?, locator, columns, predicates)
    }

    fn write_table(&self, batch: &RecordBatch, locator: &Locator) -> Result<(), CellStoreError> {
        let path = self.path(locator);
        let parent = path
            .parent()
            .ok_or_else(|| CellStoreError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".cellstore-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            parquet_io::write_table(&mut writer, batch)?;
            writer
                .flush()
                .map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| CellStoreError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn replace(&self, source: &Locator, target: &Locator) -> Result<(), CellStoreError> {
        // rename(2) swaps the directory entry; open handles keep the old inode.
        fs::rename(self.path(source).as_std_path(), self.path(target).as_std_path())
            .map_err(|err| map_io(source, err))
    }

    fn delete(&self, locator: &Locator) -> Result<(), CellStoreError> {
        fs::remove_file(self.path(locator).as_std_path()).map_err(|err| map_io(locator, err))
    }

    fn read_bytes(&self, locator: &Locator) -> Result<Bytes, CellStoreError> {
        fs::read(self.path(locator).as_std_path())
            .map(Bytes::from)
            .map_err(|err| map_io(locator, err))
    }
}

fn map_io(locator: &Locator, err: io::Error) -> CellStoreError {
    match err.kind() {
        io::ErrorKind::NotFound => CellStoreError::NotFound(locator.to_string()),
        io::ErrorKind::PermissionDenied => {
            CellStoreError::BackendUnavailable(format!("{locator}: {err}"))
        }
        _ => CellStoreError::Filesystem(format!("{locator}: {err}")),
    }
}
