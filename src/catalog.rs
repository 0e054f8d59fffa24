//! Fragment discovery: which files make up a dataset+domain, and what columns
//! each of them carries. Only Parquet footers are read here.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{DatasetPrefix, Domain, FragmentRole};
use crate::error::CellStoreError;
use crate::layout::{Layout, Locator};
use crate::storage::parquet_io::column_names;
use crate::storage::{StorageBackend, StorageResolver};

#[derive(Debug, Clone, Serialize)]
pub struct Fragment {
    pub locator: Locator,
    pub role: FragmentRole,
    pub columns: Vec<String>,
    #[serde(skip)]
    pub schema: SchemaRef,
}

impl Fragment {
    pub fn new(locator: Locator, role: FragmentRole, schema: SchemaRef) -> Self {
        Self {
            locator,
            role,
            columns: column_names(&schema),
            schema,
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|name| name == column)
    }

    pub fn missing_keys(&self, domain: Domain) -> Vec<String> {
        domain
            .join_keys()
            .iter()
            .filter(|key| !self.has_column(key))
            .map(|key| key.to_string())
            .collect()
    }
}

/// A fragment left out of planning and compaction, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct ExcludedFragment {
    pub locator: Locator,
    pub role: FragmentRole,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub dataset: DatasetPrefix,
    pub domain: Domain,
    pub backend: &'static str,
    pub core: Option<Fragment>,
    /// Valid extensions in stable (lexicographic) discovery order.
    pub extensions: Vec<Fragment>,
    /// Readable fragments lacking a key column.
    pub invalid: Vec<Fragment>,
    pub unreadable: Vec<ExcludedFragment>,
    pub warnings: Vec<String>,
    pub discovered_at: DateTime<Utc>,
    #[serde(skip)]
    pub storage: Arc<dyn StorageBackend>,
}

impl CatalogSnapshot {
    pub fn core(&self) -> Result<&Fragment, CellStoreError> {
        self.core.as_ref().ok_or_else(|| {
            CellStoreError::NotFound(format!(
                "no core fragment for {}/{}",
                self.dataset, self.domain
            ))
        })
    }

    /// Scans storage without touching any cache.
    pub fn scan(
        resolver: &StorageResolver,
        dataset: &DatasetPrefix,
        domain: Domain,
        force_remote: bool,
    ) -> Result<Self, CellStoreError> {
        let layout = Layout::new(dataset);
        let core_locator = layout.core(domain);
        let storage = match resolver.resolve(&core_locator, force_remote) {
            Ok(storage) => storage,
            // No copy anywhere: the local tree is scanned and reports no core.
            Err(CellStoreError::NotFound(_)) => resolver.local(),
            Err(err) => return Err(err),
        };
        let listed = storage.list_fragments(&layout.fragment_prefix(domain))?;

        let mut snapshot = CatalogSnapshot {
            dataset: dataset.clone(),
            domain,
            backend: storage.kind(),
            core: None,
            extensions: Vec::new(),
            invalid: Vec::new(),
            unreadable: Vec::new(),
            warnings: Vec::new(),
            discovered_at: Utc::now(),
            storage: Arc::clone(&storage),
        };

        for locator in listed {
            let Some(role) = layout.classify(domain, &locator) else {
                continue;
            };
            let schema = match storage.read_schema(&locator) {
                Ok(schema) => schema,
                // The base fragment being unreadable is fatal to the dataset.
                Err(err) if role == FragmentRole::Core => return Err(err),
                Err(err) => {
                    warn!(locator = %locator, error = %err, "skipping unreadable fragment");
                    snapshot
                        .warnings
                        .push(format!("skipped {}: unreadable ({err})", locator.file_name()));
                    snapshot.unreadable.push(ExcludedFragment {
                        locator,
                        role,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let fragment = Fragment::new(locator, role, schema);
            let missing = fragment.missing_keys(domain);
            if !missing.is_empty() {
                let err = CellStoreError::MissingKeyColumns {
                    locator: fragment.locator.file_name().to_string(),
                    missing,
                };
                warn!(locator = %fragment.locator, error = %err, "fragment excluded");
                snapshot.warnings.push(format!("skipped {err}"));
                snapshot.invalid.push(fragment);
                continue;
            }

            match role {
                FragmentRole::Core => snapshot.core = Some(fragment),
                FragmentRole::Extension => snapshot.extensions.push(fragment),
            }
        }

        info!(
            dataset = %dataset,
            domain = %domain,
            backend = snapshot.backend,
            core = snapshot.core.is_some(),
            extensions = snapshot.extensions.len(),
            excluded = snapshot.invalid.len() + snapshot.unreadable.len(),
            "discovered fragments"
        );
        Ok(snapshot)
    }
}

type Slot = Arc<Mutex<Option<Arc<CatalogSnapshot>>>>;

/// Cache of [`CatalogSnapshot`]s keyed strictly by `(dataset, domain)`.
/// Each key has its own lock so unrelated datasets never wait on each other.
#[derive(Debug)]
pub struct FragmentCatalog {
    resolver: StorageResolver,
    slots: Mutex<HashMap<(DatasetPrefix, Domain), Slot>>,
}

impl FragmentCatalog {
    pub fn new(resolver: StorageResolver) -> Self {
        Self {
            resolver,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &StorageResolver {
        &self.resolver
    }

    fn slot(&self, dataset: &DatasetPrefix, domain: Domain) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry((dataset.clone(), domain)).or_default())
    }

    pub fn discover(
        &self,
        dataset: &DatasetPrefix,
        domain: Domain,
    ) -> Result<Arc<CatalogSnapshot>, CellStoreError> {
        let slot = self.slot(dataset, domain);
        let mut cached = slot.lock();
        if let Some(snapshot) = cached.as_ref() {
            debug!(dataset = %dataset, domain = %domain, "catalog cache hit");
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = Arc::new(CatalogSnapshot::scan(&self.resolver, dataset, domain, false)?);
        *cached = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Drops the cached entry and rescans; `force_remote` bypasses local files.
    pub fn refresh(
        &self,
        dataset: &DatasetPrefix,
        domain: Domain,
        force_remote: bool,
    ) -> Result<Arc<CatalogSnapshot>, CellStoreError> {
        let slot = self.slot(dataset, domain);
        let mut cached = slot.lock();
        *cached = None;
        let snapshot = Arc::new(CatalogSnapshot::scan(
            &self.resolver,
            dataset,
            domain,
            force_remote,
        )?);
        *cached = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn invalidate(&self, dataset: &DatasetPrefix, domain: Domain) {
        let slot = self.slot(dataset, domain);
        *slot.lock() = None;
        debug!(dataset = %dataset, domain = %domain, "catalog cache invalidated");
    }

    pub fn invalidate_dataset(&self, dataset: &DatasetPrefix) {
        for domain in Domain::ALL {
            self.invalidate(dataset, domain);
        }
    }
}
