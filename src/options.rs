//! Filter choices (clusters, subjects) offered for a dataset, read from the
//! core fragment and cached per `(dataset, domain)`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arrow::array::{Array, AsArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::catalog::CatalogSnapshot;
use crate::domain::{DatasetPrefix, Domain};
use crate::error::CellStoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetOptions {
    pub clusters: Vec<String>,
    pub subjects: Vec<String>,
}

impl DatasetOptions {
    pub fn load(snapshot: &CatalogSnapshot) -> Result<Self, CellStoreError> {
        let core = snapshot.core()?;
        let domain = snapshot.domain;
        let wanted = [domain.cluster_column(), domain.subject_column()]
            .into_iter()
            .filter(|column| core.has_column(column))
            .map(str::to_string)
            .collect::<Vec<_>>();
        if wanted.is_empty() {
            return Ok(Self::default());
        }
        let table = snapshot.storage.read_table(&core.locator, &wanted, &[])?;
        Ok(Self {
            clusters: distinct_values(&table, domain.cluster_column())?,
            subjects: distinct_values(&table, domain.subject_column())?,
        })
    }
}

fn distinct_values(table: &RecordBatch, column: &str) -> Result<Vec<String>, CellStoreError> {
    let Some(array) = table.column_by_name(column) else {
        return Ok(Vec::new());
    };
    let strings = cast(array, &DataType::Utf8)
        .map_err(|err| CellStoreError::Execution(format!("{column}: {err}")))?;
    let strings = strings.as_string::<i32>();
    let values = strings
        .iter()
        .flatten()
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    Ok(values.into_iter().collect())
}

#[derive(Debug, Default)]
pub struct OptionsCache {
    entries: Mutex<HashMap<(DatasetPrefix, Domain), Arc<DatasetOptions>>>,
}

impl OptionsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(
        &self,
        snapshot: &CatalogSnapshot,
    ) -> Result<Arc<DatasetOptions>, CellStoreError> {
        let key = (snapshot.dataset.clone(), snapshot.domain);
        if let Some(options) = self.entries.lock().get(&key) {
            debug!(dataset = %key.0, domain = %key.1, "options cache hit");
            return Ok(Arc::clone(options));
        }
        let options = Arc::new(DatasetOptions::load(snapshot)?);
        self.entries.lock().insert(key, Arc::clone(&options));
        Ok(options)
    }

    pub fn invalidate(&self, dataset: &DatasetPrefix, domain: Domain) {
        self.entries.lock().remove(&(dataset.clone(), domain));
    }

    pub fn invalidate_dataset(&self, dataset: &DatasetPrefix) {
        self.entries.lock().retain(|(cached, _), _| cached != dataset);
    }
}
