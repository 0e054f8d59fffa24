//! Folds extension fragments into the core fragment.
//!
//! The widened table is written next to the core fragment first and only
//! then moved over it, so a failure at any earlier point leaves every
//! existing fragment untouched. Merged extensions are deleted afterwards.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{CatalogSnapshot, Fragment};
use crate::domain::{DatasetPrefix, Domain};
use crate::error::CellStoreError;
use crate::executor;
use crate::layout::{Layout, Locator};
use crate::planner::{CORE_ALIAS, Owner, PlannedJoin, QueryPlan, SelectItem};
use crate::storage::StorageBackend;

#[derive(Debug, Clone, Serialize)]
pub struct CompactionResult {
    pub dataset: DatasetPrefix,
    pub domain: Domain,
    /// Extension fragments folded into core (with or without new columns).
    pub merged: Vec<Locator>,
    pub new_columns: usize,
    pub added_columns: Vec<String>,
    /// Fragments without key columns removed as redundant.
    pub removed_invalid: Vec<Locator>,
    /// Merged fragments whose deletion failed; a later run retries them.
    pub left_in_place: Vec<Locator>,
    pub core_rewritten: bool,
    pub rows: usize,
}

impl CompactionResult {
    fn empty(dataset: &DatasetPrefix, domain: Domain) -> Self {
        Self {
            dataset: dataset.clone(),
            domain,
            merged: Vec::new(),
            new_columns: 0,
            added_columns: Vec::new(),
            removed_invalid: Vec::new(),
            left_in_place: Vec::new(),
            core_rewritten: false,
            rows: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Compactor {
    delete_invalid_fragments: bool,
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Compactor {
    pub fn new(delete_invalid_fragments: bool) -> Self {
        Self {
            delete_invalid_fragments,
        }
    }

    /// Compacts the fragments described by a freshly scanned snapshot.
    pub fn compact(&self, snapshot: &CatalogSnapshot) -> Result<CompactionResult, CellStoreError> {
        let dataset = &snapshot.dataset;
        let domain = snapshot.domain;
        let storage = snapshot.storage.as_ref();
        let mut result = CompactionResult::empty(dataset, domain);

        let Some(core) = snapshot.core.as_ref() else {
            info!(dataset = %dataset, domain = %domain, "no core fragment; nothing to compact");
            return Ok(result);
        };
        if snapshot.extensions.is_empty() && snapshot.invalid.is_empty() {
            info!(dataset = %dataset, domain = %domain, "no extension fragments; nothing to compact");
            return Ok(result);
        }

        let mut claimed = core
            .columns
            .iter()
            .cloned()
            .chain(domain.join_keys().iter().map(|key| key.to_string()))
            .collect::<BTreeSet<_>>();
        let mut joins = Vec::new();
        let mut merged = Vec::new();
        for (position, fragment) in snapshot.extensions.iter().enumerate() {
            let new_columns = fragment
                .columns
                .iter()
                .filter(|column| !claimed.contains(*column))
                .cloned()
                .collect::<Vec<_>>();
            merged.push(fragment.locator.clone());
            if new_columns.is_empty() {
                info!(locator = %fragment.locator, "no new columns; merged trivially");
                continue;
            }
            info!(
                locator = %fragment.locator,
                columns = new_columns.len(),
                "adding new columns"
            );
            claimed.extend(new_columns.iter().cloned());
            joins.push(PlannedJoin {
                alias: Owner::Extension(position).alias(),
                fragment: fragment.clone(),
                join_keys: domain.join_keys().iter().map(|key| key.to_string()).collect(),
                columns: new_columns,
            });
        }

        if !joins.is_empty() {
            let plan = merge_plan(snapshot, core, joins);
            result.added_columns = plan
                .select
                .iter()
                .filter(|item| item.alias != CORE_ALIAS)
                .map(|item| item.column.clone())
                .collect();
            result.new_columns = result.added_columns.len();
            result.rows = self.rewrite_core(storage, &Layout::new(dataset), domain, core, &plan)?;
            result.core_rewritten = true;
        } else {
            info!(dataset = %dataset, domain = %domain, "no new columns in any fragment");
        }

        for locator in merged {
            match storage.delete(&locator) {
                Ok(()) => {
                    info!(locator = %locator, "deleted merged fragment");
                    result.merged.push(locator);
                }
                Err(err) => {
                    warn!(locator = %locator, error = %err, "failed to delete merged fragment");
                    result.merged.push(locator.clone());
                    result.left_in_place.push(locator);
                }
            }
        }

        if self.delete_invalid_fragments {
            for fragment in &snapshot.invalid {
                match storage.delete(&fragment.locator) {
                    Ok(()) => {
                        info!(locator = %fragment.locator, "deleted fragment without key columns");
                        result.removed_invalid.push(fragment.locator.clone());
                    }
                    Err(err) => {
                        warn!(locator = %fragment.locator, error = %err, "failed to delete invalid fragment");
                        result.left_in_place.push(fragment.locator.clone());
                    }
                }
            }
        }

        info!(
            dataset = %dataset,
            domain = %domain,
            merged = result.merged.len(),
            new_columns = result.new_columns,
            rewritten = result.core_rewritten,
            "compaction finished"
        );
        Ok(result)
    }

    fn rewrite_core(
        &self,
        storage: &dyn StorageBackend,
        layout: &Layout,
        domain: Domain,
        core: &Fragment,
        plan: &QueryPlan,
    ) -> Result<usize, CellStoreError> {
        let temp = layout.compaction_temp(domain);
        let written = executor::execute(storage, plan).and_then(|output| {
            // Merge plans have no unresolved columns, so any warning is a skipped fragment.
            if let Some(warning) = output.warnings.first() {
                return Err(CellStoreError::Execution(warning.clone()));
            }
            if output.table.num_columns() != plan.select.len() {
                return Err(CellStoreError::Execution(format!(
                    "merged table has {} columns, expected {}",
                    output.table.num_columns(),
                    plan.select.len()
                )));
            }
            storage.write_table(&output.table, &temp)?;
            Ok(output.table.num_rows())
        });
        let rows = written
            .and_then(|rows| storage.replace(&temp, &core.locator).map(|_| rows))
            .inspect_err(|err| {
                warn!(locator = %core.locator, error = %err, "merge failed; core fragment untouched");
                discard_temp(storage, &temp);
            })?;
        info!(locator = %core.locator, rows, "replaced core fragment");
        Ok(rows)
    }
}

fn merge_plan(snapshot: &CatalogSnapshot, core: &Fragment, joins: Vec<PlannedJoin>) -> QueryPlan {
    let mut select = core
        .columns
        .iter()
        .map(|column| SelectItem {
            alias: CORE_ALIAS.to_string(),
            column: column.clone(),
        })
        .collect::<Vec<_>>();
    for join in &joins {
        select.extend(join.columns.iter().map(|column| SelectItem {
            alias: join.alias.clone(),
            column: column.clone(),
        }));
    }
    QueryPlan {
        dataset: snapshot.dataset.clone(),
        domain: snapshot.domain,
        base: core.clone(),
        joins,
        select,
        predicates: Vec::new(),
        unresolved: Vec::new(),
    }
}

fn discard_temp(storage: &dyn StorageBackend, temp: &Locator) {
    match storage.delete(temp) {
        Ok(()) => info!(locator = %temp, "removed temporary merge output"),
        Err(CellStoreError::NotFound(_)) => {}
        Err(err) => warn!(locator = %temp, error = %err, "failed to remove temporary merge output"),
    }
}
