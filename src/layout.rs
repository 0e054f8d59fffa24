//! Persisted naming convention shared by the local and remote backends.
//!
//! Every object is addressed by a [`Locator`]: a `/`-separated path relative
//! to the warehouse root (a local directory or an object-store key prefix).

use std::fmt;

use serde::Serialize;

use crate::domain::{DatasetPrefix, Domain, FragmentRole};

const PARQUET_EXT: &str = ".parquet";
const COLOR_DIR: &str = "Color";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        Self(value.trim_matches('/').to_string())
    }

    pub fn join(dir: &str, name: &str) -> Self {
        Self::new(format!("{}/{}", dir.trim_matches('/'), name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> &str {
        self.0.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    }

    /// Sibling locator with `suffix` appended to the file name.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}{suffix}", self.0))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File layout for one dataset.
#[derive(Debug, Clone)]
pub struct Layout {
    dataset: DatasetPrefix,
}

impl Layout {
    pub fn new(dataset: &DatasetPrefix) -> Self {
        Self {
            dataset: dataset.clone(),
        }
    }

    pub fn core(&self, domain: Domain) -> Locator {
        Locator::join(
            domain.directory(),
            &format!("{}_{}_core{PARQUET_EXT}", self.dataset, domain.token()),
        )
    }

    /// Listing prefix matching every fragment (core included) of the domain.
    pub fn fragment_prefix(&self, domain: Domain) -> Locator {
        Locator::join(
            domain.directory(),
            &format!("{}_{}_", self.dataset, domain.token()),
        )
    }

    /// Classifies a listed locator; `None` for anything that is not a fragment
    /// of this dataset+domain (temp files, JSON side files, other datasets).
    pub fn classify(&self, domain: Domain, locator: &Locator) -> Option<FragmentRole> {
        if locator.parent() != domain.directory() {
            return None;
        }
        let prefix = self.fragment_prefix(domain);
        let name = locator.file_name();
        let stem = name
            .strip_prefix(prefix.file_name())?
            .strip_suffix(PARQUET_EXT)?;
        if stem.is_empty() {
            return None;
        }
        if *locator == self.core(domain) {
            Some(FragmentRole::Core)
        } else {
            Some(FragmentRole::Extension)
        }
    }

    /// Scratch location for a compaction output, next to the core fragment.
    pub fn compaction_temp(&self, domain: Domain) -> Locator {
        self.core(domain).with_suffix(".tmp")
    }

    pub fn colors(&self) -> Locator {
        Locator::join(COLOR_DIR, &format!("{}_colors.json", self.dataset))
    }

    pub fn gene_list(&self, domain: Domain) -> Locator {
        Locator::join(
            domain.directory(),
            &format!("{}_{}_genes.json", self.dataset, domain.token()),
        )
    }

    pub fn gene_universe(&self) -> Locator {
        Locator::join(
            Domain::Gex.directory(),
            &format!("{}_avail_genelist.json", self.dataset),
        )
    }
}
