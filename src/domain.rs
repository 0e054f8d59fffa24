use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CellStoreError;

static DATASET_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*$").expect("static regex"));

pub const BARCODE: &str = "Barcode";
pub const CLUSTER: &str = "CellType_Level3";
pub const SUBJECT: &str = "Subject";
pub const STATUS: &str = "Status";

const GEX_JOIN_KEYS: &[&str] = &[BARCODE];
const GEX_METADATA: &[&str] = &[BARCODE, "UMAP_1", "UMAP_2", CLUSTER, SUBJECT, STATUS];
const PERT_JOIN_KEYS: &[&str] = &[SUBJECT, CLUSTER, STATUS];

/// Logical dataset name, e.g. `tcell` or `myeloid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetPrefix(String);

impl DatasetPrefix {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetPrefix {
    type Err = CellStoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !DATASET_PREFIX.is_match(normalized) {
            return Err(CellStoreError::InvalidDataset(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Gex,
    Pert,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Gex, Domain::Pert];

    /// Token used in fragment file names (`{prefix}_{token}_core.parquet`).
    pub fn token(self) -> &'static str {
        match self {
            Domain::Gex => "gex",
            Domain::Pert => "pert",
        }
    }

    /// Directory holding this domain's fragments, locally and remotely.
    pub fn directory(self) -> &'static str {
        match self {
            Domain::Gex => "GEX",
            Domain::Pert => "Pert",
        }
    }

    /// Columns every fragment must carry; every join in a plan uses exactly these.
    pub fn join_keys(self) -> &'static [&'static str] {
        match self {
            Domain::Gex => GEX_JOIN_KEYS,
            Domain::Pert => PERT_JOIN_KEYS,
        }
    }

    /// Columns returned with every query when some fragment owns them.
    pub fn metadata_columns(self) -> &'static [&'static str] {
        match self {
            Domain::Gex => GEX_METADATA,
            Domain::Pert => PERT_JOIN_KEYS,
        }
    }

    pub fn cluster_column(self) -> &'static str {
        CLUSTER
    }

    pub fn subject_column(self) -> &'static str {
        SUBJECT
    }

    pub fn is_key(self, column: &str) -> bool {
        self.join_keys().contains(&column)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

impl FromStr for Domain {
    type Err = CellStoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gex" => Ok(Domain::Gex),
            "pert" => Ok(Domain::Pert),
            _ => Err(CellStoreError::InvalidDomain(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentRole {
    Core,
    Extension,
}

/// Requested column set: everything owned, or a named list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelection {
    All,
    Named(Vec<String>),
}

impl ColumnSelection {
    /// Parses CLI/API input: `*` (or nothing) selects all columns.
    pub fn parse_list(values: &[String]) -> Self {
        if values.is_empty() || values.iter().any(|value| value.trim() == "*") {
            return ColumnSelection::All;
        }
        let mut names = Vec::new();
        for value in values {
            let name = value.trim();
            if !name.is_empty() && !names.iter().any(|existing| existing == name) {
                names.push(name.to_string());
            }
        }
        ColumnSelection::Named(names)
    }
}
