//! Small JSON side files kept next to the fragments: the per-dataset color
//! map, the list of already-extracted genes and the full gene universe.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{DatasetPrefix, Domain};
use crate::error::CellStoreError;
use crate::layout::{Layout, Locator};
use crate::storage::StorageResolver;

pub type ColorMap = BTreeMap<String, String>;

/// Parses a color map, repairing files written with Python-style quoting.
pub fn parse_color_map(text: &str) -> Result<ColorMap, CellStoreError> {
    let trimmed = text.trim();
    let repaired;
    let text = if trimmed.starts_with("{'") {
        repaired = trimmed.replace('\'', "\"");
        repaired.as_str()
    } else {
        trimmed
    };
    serde_json::from_str(text).map_err(|err| CellStoreError::corrupt("color map", err))
}

#[derive(Debug)]
pub struct SideMetadata {
    resolver: StorageResolver,
    colors: Mutex<HashMap<DatasetPrefix, Arc<ColorMap>>>,
    genes: Mutex<HashMap<(DatasetPrefix, Domain), Arc<Vec<String>>>>,
}

impl SideMetadata {
    pub fn new(resolver: StorageResolver) -> Self {
        Self {
            resolver,
            colors: Mutex::new(HashMap::new()),
            genes: Mutex::new(HashMap::new()),
        }
    }

    /// Reads a side file; `Ok(None)` when neither backend has it.
    fn load<T>(
        &self,
        locator: &Locator,
        force_remote: bool,
        parse: impl FnOnce(&str) -> Result<T, CellStoreError>,
    ) -> Result<Option<T>, CellStoreError> {
        let storage = match self.resolver.resolve(locator, force_remote) {
            Ok(storage) => storage,
            Err(CellStoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let bytes = match storage.read_bytes(locator) {
            Ok(bytes) => bytes,
            Err(CellStoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let text = String::from_utf8_lossy(&bytes);
        parse(&text).map(Some)
    }

    /// Column name -> color. A missing file is an empty map.
    pub fn colors(
        &self,
        dataset: &DatasetPrefix,
        force_remote: bool,
    ) -> Result<Arc<ColorMap>, CellStoreError> {
        if !force_remote {
            if let Some(colors) = self.colors.lock().get(dataset) {
                return Ok(Arc::clone(colors));
            }
        }
        let locator = Layout::new(dataset).colors();
        let colors = Arc::new(
            self.load(&locator, force_remote, parse_color_map)?
                .unwrap_or_default(),
        );
        debug!(dataset = %dataset, entries = colors.len(), "loaded color map");
        self.colors
            .lock()
            .insert(dataset.clone(), Arc::clone(&colors));
        Ok(colors)
    }

    /// Genes already extracted into fragments. Empty results are not cached
    /// so a later backfill is picked up without an explicit invalidation.
    pub fn gene_list(
        &self,
        dataset: &DatasetPrefix,
        domain: Domain,
        force_remote: bool,
    ) -> Result<Arc<Vec<String>>, CellStoreError> {
        let key = (dataset.clone(), domain);
        if !force_remote {
            if let Some(genes) = self.genes.lock().get(&key) {
                debug!(dataset = %dataset, domain = %domain, "gene list cache hit");
                return Ok(Arc::clone(genes));
            }
        }
        let locator = Layout::new(dataset).gene_list(domain);
        let genes = self
            .load(&locator, force_remote, |text| parse_gene_array(&locator, text))?
            .unwrap_or_default();
        let genes = Arc::new(genes);
        if !genes.is_empty() {
            self.genes.lock().insert(key, Arc::clone(&genes));
        }
        Ok(genes)
    }

    /// Every gene the backfill producer knows how to extract. Never cached.
    pub fn gene_universe(
        &self,
        dataset: &DatasetPrefix,
        force_remote: bool,
    ) -> Result<Vec<String>, CellStoreError> {
        let locator = Layout::new(dataset).gene_universe();
        Ok(self
            .load(&locator, force_remote, |text| parse_gene_array(&locator, text))?
            .unwrap_or_default())
    }

    /// Splits `genes` into those already extracted and those still missing.
    /// Always rereads the gene list.
    pub fn check_availability(
        &self,
        dataset: &DatasetPrefix,
        genes: &[String],
        force_remote: bool,
    ) -> Result<(Vec<String>, Vec<String>), CellStoreError> {
        self.invalidate_genes(dataset);
        let available = self.gene_list(dataset, Domain::Gex, force_remote)?;
        if available.is_empty() {
            warn!(dataset = %dataset, "gene index not found; treating all genes as missing");
            return Ok((Vec::new(), genes.to_vec()));
        }
        let available = available.iter().map(String::as_str).collect::<HashSet<_>>();
        let (found, missing): (Vec<String>, Vec<String>) = genes
            .iter()
            .cloned()
            .partition(|gene| available.contains(gene.as_str()));
        info!(
            dataset = %dataset,
            found = found.len(),
            missing = missing.len(),
            "checked gene availability"
        );
        Ok((found, missing))
    }

    pub fn invalidate_genes(&self, dataset: &DatasetPrefix) {
        self.genes.lock().retain(|(cached, _), _| cached != dataset);
    }

    pub fn invalidate_colors(&self, dataset: &DatasetPrefix) {
        self.colors.lock().remove(dataset);
    }

    pub fn invalidate_dataset(&self, dataset: &DatasetPrefix) {
        self.invalidate_genes(dataset);
        self.invalidate_colors(dataset);
    }
}

fn parse_gene_array(locator: &Locator, text: &str) -> Result<Vec<String>, CellStoreError> {
    serde_json::from_str(text).map_err(|err| CellStoreError::corrupt(locator, err))
}
