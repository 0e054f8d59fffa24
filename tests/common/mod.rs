#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, StringArray};
use arrow::datatypes::{Float64Type, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use cellstore::backfill::Unconfigured;
use cellstore::domain::DatasetPrefix;
use cellstore::engine::{Engine, EngineSettings};
use cellstore::error::CellStoreError;
use cellstore::layout::Locator;
use cellstore::storage::{ColumnPredicate, LocalStore, StorageBackend, StorageResolver};

pub const GEX_CORE: &str = "GEX/tcell_gex_core.parquet";
pub const PERT_CORE: &str = "Pert/tcell_pert_core.parquet";

/// A throwaway `DataWarehouse/` directory.
pub struct Warehouse {
    pub dir: TempDir,
    pub store: Arc<LocalStore>,
}

impl Warehouse {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("DataWarehouse")).unwrap();
        std::fs::create_dir_all(&root).unwrap();
        Self {
            dir,
            store: Arc::new(LocalStore::new(root)),
        }
    }

    pub fn root(&self) -> Utf8PathBuf {
        self.store.root().to_path_buf()
    }

    pub fn write(&self, path: &str, batch: &RecordBatch) {
        self.store.write_table(batch, &Locator::new(path)).unwrap();
    }

    pub fn write_raw(&self, path: &str, contents: &[u8]) {
        let full = self.root().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }

    pub fn exists(&self, path: &str) -> bool {
        self.root().join(path).as_std_path().is_file()
    }

    pub fn read(&self, path: &str) -> RecordBatch {
        let locator = Locator::new(path);
        let schema = self.store.read_schema(&locator).unwrap();
        let columns = schema
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect::<Vec<_>>();
        self.store.read_table(&locator, &columns, &[]).unwrap()
    }

    pub fn engine(&self) -> Engine {
        Engine::local(self.root(), EngineSettings::default()).unwrap()
    }
}

pub fn tcell() -> DatasetPrefix {
    "tcell".parse().unwrap()
}

pub fn strings(values: &[&str]) -> ArrayRef {
    Arc::new(StringArray::from(values.to_vec()))
}

pub fn floats(values: &[f64]) -> ArrayRef {
    Arc::new(Float64Array::from(values.to_vec()))
}

pub fn batch(columns: Vec<(&str, ArrayRef)>) -> RecordBatch {
    RecordBatch::try_from_iter(columns).unwrap()
}

/// Four cells, two subjects, `CD4` already extracted.
pub fn gex_core() -> RecordBatch {
    batch(vec![
        ("Barcode", strings(&["AAA", "CCC", "GGG", "TTT"])),
        ("UMAP_1", floats(&[0.1, 0.2, 0.3, 0.4])),
        ("UMAP_2", floats(&[1.1, 1.2, 1.3, 1.4])),
        ("CellType_Level3", strings(&["CD4 Naive", "CD8 TEM", "CD4 Naive", "Treg"])),
        ("Subject", strings(&["S1", "S1", "S2", "S2"])),
        ("Status", strings(&["Healthy", "HSV", "Healthy", "HSV"])),
        ("CD4", floats(&[5.0, 0.1, 4.2, 3.3])),
    ])
}

/// Covers two of the core barcodes plus one unknown; repeats `CD4` with other values.
pub fn cd8a_extension() -> RecordBatch {
    batch(vec![
        ("Barcode", strings(&["GGG", "AAA", "ZZZ"])),
        ("CD4", floats(&[99.0, 99.0, 99.0])),
        ("CD8A", floats(&[2.5, 0.5, 9.9])),
    ])
}

pub fn foxp3_extension() -> RecordBatch {
    batch(vec![
        ("Barcode", strings(&["TTT", "CCC"])),
        ("FOXP3", floats(&[7.0, 0.0])),
    ])
}

pub fn column_names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect()
}

pub fn float_column(batch: &RecordBatch, name: &str) -> Vec<Option<f64>> {
    let column = batch.column_by_name(name).unwrap();
    let values = column.as_primitive::<Float64Type>();
    (0..values.len())
        .map(|row| (!values.is_null(row)).then(|| values.value(row)))
        .collect()
}

pub fn string_column(batch: &RecordBatch, name: &str) -> Vec<String> {
    let column = batch.column_by_name(name).unwrap();
    column
        .as_string::<i32>()
        .iter()
        .map(|value| value.unwrap_or_default().to_string())
        .collect()
}

/// Blocks `list_fragments` while closed, so a scan can be held mid-flight.
#[derive(Default)]
pub struct Gate {
    closed: Mutex<bool>,
    changed: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        let gate = Self::default();
        *gate.closed.lock().unwrap() = true;
        Arc::new(gate)
    }

    pub fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.changed.notify_all();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Spins until `count` callers have reached the gate.
    pub fn wait_for(&self, count: usize) {
        let started = Instant::now();
        while self.entered() < count {
            assert!(started.elapsed() < Duration::from_secs(10), "gate never reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut closed = self.closed.lock().unwrap();
        while *closed {
            closed = self.changed.wait(closed).unwrap();
        }
    }
}

/// Wraps a backend with a gate on listing and optionally failing `replace` or `delete`.
#[derive(Debug)]
pub struct TestStore {
    inner: Arc<dyn StorageBackend>,
    gate: Option<Arc<Gate>>,
    fail_replace: bool,
    fail_delete: bool,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate").field("entered", &self.entered()).finish()
    }
}

impl TestStore {
    pub fn gated(inner: Arc<dyn StorageBackend>, gate: Arc<Gate>) -> Self {
        Self {
            inner,
            gate: Some(gate),
            fail_replace: false,
            fail_delete: false,
        }
    }

    pub fn failing_replace(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            gate: None,
            fail_replace: true,
            fail_delete: false,
        }
    }

    pub fn failing_delete(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            gate: None,
            fail_replace: false,
            fail_delete: true,
        }
    }

    pub fn engine(self) -> Engine {
        let resolver = StorageResolver::local_only(Arc::new(self));
        Engine::with_parts(resolver, Arc::new(Unconfigured), EngineSettings::default()).unwrap()
    }
}

impl StorageBackend for TestStore {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn exists(&self, locator: &Locator) -> Result<bool, CellStoreError> {
        self.inner.exists(locator)
    }

    fn list_fragments(&self, prefix: &Locator) -> Result<Vec<Locator>, CellStoreError> {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        self.inner.list_fragments(prefix)
    }

    fn read_schema(&self, locator: &Locator) -> Result<SchemaRef, CellStoreError> {
        self.inner.read_schema(locator)
    }

    fn read_table(
        &self,
        locator: &Locator,
        columns: &[String],
        predicates: &[ColumnPredicate],
    ) -> Result<RecordBatch, CellStoreError> {
        self.inner.read_table(locator, columns, predicates)
    }

    fn write_table(&self, batch: &RecordBatch, locator: &Locator) -> Result<(), CellStoreError> {
        self.inner.write_table(batch, locator)
    }

    fn replace(&self, source: &Locator, target: &Locator) -> Result<(), CellStoreError> {
        if self.fail_replace {
            return Err(CellStoreError::BackendUnavailable(format!(
                "injected failure replacing {target}"
            )));
        }
        self.inner.replace(source, target)
    }

    fn delete(&self, locator: &Locator) -> Result<(), CellStoreError> {
        if self.fail_delete {
            return Err(CellStoreError::BackendUnavailable(format!(
                "injected failure deleting {locator}"
            )));
        }
        self.inner.delete(locator)
    }

    fn read_bytes(&self, locator: &Locator) -> Result<Bytes, CellStoreError> {
        self.inner.read_bytes(locator)
    }
}
