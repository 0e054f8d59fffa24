//! Turns a [`QueryRequest`] plus a [`CatalogSnapshot`] into an explicit
//! [`QueryPlan`]: the base fragment, the extension fragments worth joining,
//! and which fragment supplies each selected column.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;

use crate::catalog::{CatalogSnapshot, Fragment};
use crate::domain::{ColumnSelection, DatasetPrefix, Domain};
use crate::error::CellStoreError;
use crate::storage::ColumnPredicate;

pub const CORE_ALIAS: &str = "core";

/// Equality-or-membership filters on key columns, evaluated on the base fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilters(BTreeMap<String, BTreeSet<String>>);

impl RowFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a membership filter; an empty value set means "no filter".
    pub fn with(mut self, column: &str, values: impl IntoIterator<Item = String>) -> Self {
        let values = values.into_iter().collect::<BTreeSet<_>>();
        if !values.is_empty() {
            self.0.entry(column.to_string()).or_default().extend(values);
        }
        self
    }

    /// The `cluster` / `subject` filters of the query API.
    pub fn from_api(domain: Domain, clusters: &[String], subjects: &[String]) -> Self {
        Self::new()
            .with(domain.cluster_column(), clusters.iter().cloned())
            .with(domain.subject_column(), subjects.iter().cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn predicates(&self) -> Vec<ColumnPredicate> {
        self.0
            .iter()
            .map(|(column, values)| ColumnPredicate::new(column.clone(), values.iter().cloned()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub dataset: DatasetPrefix,
    pub domain: Domain,
    pub columns: ColumnSelection,
    pub filters: RowFilters,
}

impl QueryRequest {
    pub fn new(dataset: DatasetPrefix, domain: Domain, columns: ColumnSelection) -> Self {
        Self {
            dataset,
            domain,
            columns,
            filters: RowFilters::new(),
        }
    }

    /// Builds a request from untyped API arguments (`"*"` or an empty list selects everything).
    pub fn from_api(
        dataset: &str,
        domain: &str,
        columns: &[String],
        clusters: &[String],
        subjects: &[String],
    ) -> Result<Self, CellStoreError> {
        let dataset = dataset.parse::<DatasetPrefix>()?;
        let domain = domain.parse::<Domain>()?;
        Ok(Self::new(dataset, domain, ColumnSelection::parse_list(columns))
            .with_filters(RowFilters::from_api(domain, clusters, subjects)))
    }

    pub fn with_filters(mut self, filters: RowFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// Which fragment supplies a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Core,
    /// Index into [`CatalogSnapshot::extensions`].
    Extension(usize),
}

impl Owner {
    pub fn alias(self) -> String {
        match self {
            Owner::Core => CORE_ALIAS.to_string(),
            Owner::Extension(index) => format!("t{index}"),
        }
    }
}

/// Column -> owning fragment. Core columns always win; among extensions the
/// first one in discovery order wins.
#[derive(Debug, Clone, Default)]
pub struct ColumnOwnership {
    order: Vec<(String, Owner)>,
    index: HashMap<String, usize>,
}

impl ColumnOwnership {
    pub fn build(core: &Fragment, extensions: &[Fragment]) -> Self {
        let mut ownership = Self::default();
        for column in &core.columns {
            ownership.register(column, Owner::Core);
        }
        for (position, fragment) in extensions.iter().enumerate() {
            for column in &fragment.columns {
                ownership.register(column, Owner::Extension(position));
            }
        }
        ownership
    }

    fn register(&mut self, column: &str, owner: Owner) {
        if self.index.contains_key(column) {
            return;
        }
        self.index.insert(column.to_string(), self.order.len());
        self.order.push((column.to_string(), owner));
    }

    pub fn owner(&self, column: &str) -> Option<Owner> {
        self.index.get(column).map(|&position| self.order[position].1)
    }

    /// Owned columns in registration order (core schema order, then extensions).
    pub fn columns(&self) -> impl Iterator<Item = (&str, Owner)> {
        self.order
            .iter()
            .map(|(column, owner)| (column.as_str(), *owner))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectItem {
    pub alias: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedJoin {
    pub alias: String,
    pub fragment: Fragment,
    pub join_keys: Vec<String>,
    /// Columns this fragment supplies to the select list.
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    pub dataset: DatasetPrefix,
    pub domain: Domain,
    pub base: Fragment,
    pub joins: Vec<PlannedJoin>,
    pub select: Vec<SelectItem>,
    #[serde(skip)]
    pub predicates: Vec<ColumnPredicate>,
    /// Requested columns no fragment owns.
    pub unresolved: Vec<String>,
}

impl QueryPlan {
    pub fn join_keys(&self) -> &'static [&'static str] {
        self.domain.join_keys()
    }

    pub fn base_columns(&self) -> Vec<String> {
        self.select
            .iter()
            .filter(|item| item.alias == CORE_ALIAS)
            .map(|item| item.column.clone())
            .collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.select.iter().map(|item| item.column.clone()).collect()
    }
}

/// SQL-shaped rendering, for logs and `--explain` output only.
impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let select = self
            .select
            .iter()
            .map(|item| format!("{}.\"{}\"", item.alias, item.column))
            .collect::<Vec<_>>();
        writeln!(f, "SELECT {}", select.join(", "))?;
        writeln!(f, "FROM '{}' AS {CORE_ALIAS}", self.base.locator)?;
        for join in &self.joins {
            let on = join
                .join_keys
                .iter()
                .map(|key| format!("{CORE_ALIAS}.\"{key}\" = {}.\"{key}\"", join.alias))
                .collect::<Vec<_>>();
            writeln!(
                f,
                "LEFT JOIN '{}' AS {} ON {}",
                join.fragment.locator,
                join.alias,
                on.join(" AND ")
            )?;
        }
        if !self.predicates.is_empty() {
            let clauses = self
                .predicates
                .iter()
                .map(|predicate| {
                    let values = predicate
                        .values
                        .iter()
                        .map(|value| format!("'{value}'"))
                        .collect::<Vec<_>>();
                    format!("{CORE_ALIAS}.\"{}\" IN ({})", predicate.column, values.join(", "))
                })
                .collect::<Vec<_>>();
            writeln!(f, "WHERE {}", clauses.join(" AND "))?;
        }
        Ok(())
    }
}

pub fn plan(snapshot: &CatalogSnapshot, request: &QueryRequest) -> Result<QueryPlan, CellStoreError> {
    let core = snapshot.core()?;
    let ownership = ColumnOwnership::build(core, &snapshot.extensions);

    let mut selected: Vec<(String, Owner)> = Vec::new();
    let mut unresolved = Vec::new();
    match &request.columns {
        ColumnSelection::All => {
            selected.extend(
                ownership
                    .columns()
                    .map(|(column, owner)| (column.to_string(), owner)),
            );
        }
        ColumnSelection::Named(names) => {
            let metadata = request.domain.metadata_columns().iter().copied();
            for column in metadata {
                if let Some(owner) = ownership.owner(column) {
                    selected.push((column.to_string(), owner));
                }
            }
            for column in names {
                if selected.iter().any(|(existing, _)| existing == column) {
                    continue;
                }
                match ownership.owner(column) {
                    Some(owner) => selected.push((column.clone(), owner)),
                    None if !unresolved.contains(column) => unresolved.push(column.clone()),
                    None => {}
                }
            }
        }
    }

    let mut joins = Vec::new();
    for (position, fragment) in snapshot.extensions.iter().enumerate() {
        let owner = Owner::Extension(position);
        let columns = selected
            .iter()
            .filter(|(_, candidate)| *candidate == owner)
            .map(|(column, _)| column.clone())
            .collect::<Vec<_>>();
        if columns.is_empty() {
            continue;
        }
        joins.push(PlannedJoin {
            alias: owner.alias(),
            fragment: fragment.clone(),
            join_keys: request.domain.join_keys().iter().map(|key| key.to_string()).collect(),
            columns,
        });
    }

    let predicates = request.filters.predicates();
    for predicate in &predicates {
        if !core.has_column(&predicate.column) {
            return Err(CellStoreError::InvalidFilter(format!(
                "{} is not a column of {}",
                predicate.column, core.locator
            )));
        }
    }

    Ok(QueryPlan {
        dataset: request.dataset.clone(),
        domain: request.domain,
        base: core.clone(),
        joins,
        select: selected
            .into_iter()
            .map(|(column, owner)| SelectItem {
                alias: owner.alias(),
                column,
            })
            .collect(),
        predicates,
        unresolved,
    })
}
