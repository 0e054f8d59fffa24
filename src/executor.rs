//! Executes a [`QueryPlan`]: filtered base read, then one hash left join per
//! planned extension fragment on the domain's fixed key tuple.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Instant;

use arrow::array::{Array, ArrayRef, UInt32Array, new_null_array};
use arrow::compute::{cast, take};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::row::{RowConverter, SortField};
use tracing::{debug, info, warn};

use crate::error::CellStoreError;
use crate::planner::{CORE_ALIAS, PlannedJoin, QueryPlan};
use crate::storage::StorageBackend;

#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub table: RecordBatch,
    pub warnings: Vec<String>,
}

pub fn execute(storage: &dyn StorageBackend, plan: &QueryPlan) -> Result<QueryOutput, CellStoreError> {
    let started = Instant::now();
    debug!(plan = %plan, "executing plan");

    let keys = plan
        .join_keys()
        .iter()
        .map(|key| key.to_string())
        .collect::<Vec<_>>();
    let mut base_columns = plan.base_columns();
    if !plan.joins.is_empty() {
        for key in &keys {
            if !base_columns.contains(key) {
                base_columns.push(key.clone());
            }
        }
    }
    let base = storage.read_table(&plan.base.locator, &base_columns, &plan.predicates)?;

    let mut warnings = Vec::new();
    let mut joined: HashMap<(String, String), (Arc<Field>, ArrayRef)> = HashMap::new();
    if !plan.joins.is_empty() {
        let base_keys = key_arrays(&base, &keys)?;
        for join in &plan.joins {
            let columns = match left_join(storage, &base_keys, join) {
                Ok(columns) => columns,
                // A broken extension costs its columns, never the query.
                Err(err @ CellStoreError::CorruptFragment { .. }) => {
                    warn!(locator = %join.fragment.locator, error = %err, "skipping unreadable fragment");
                    warnings.push(format!(
                        "skipped {}: unreadable ({err})",
                        join.fragment.locator.file_name()
                    ));
                    null_columns(join, base.num_rows())?
                }
                Err(err) => return Err(err),
            };
            for (column, field, array) in columns {
                joined.insert((join.alias.clone(), column), (field, array));
            }
        }
    }

    let mut fields = Vec::with_capacity(plan.select.len());
    let mut arrays = Vec::with_capacity(plan.select.len());
    for item in &plan.select {
        if item.alias == CORE_ALIAS {
            let index = base
                .schema()
                .index_of(&item.column)
                .map_err(|err| CellStoreError::Execution(err.to_string()))?;
            fields.push(Arc::new(base.schema().field(index).clone()));
            arrays.push(Arc::clone(base.column(index)));
        } else {
            let (field, array) = joined
                .remove(&(item.alias.clone(), item.column.clone()))
                .ok_or_else(|| {
                    CellStoreError::Execution(format!(
                        "join {} produced no column {}",
                        item.alias, item.column
                    ))
                })?;
            fields.push(field);
            arrays.push(array);
        }
    }

    let options = RecordBatchOptions::new().with_row_count(Some(base.num_rows()));
    let table = RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        arrays,
        &options,
    )
    .map_err(|err| CellStoreError::Execution(err.to_string()))?;

    warnings.extend(
        plan.unresolved
            .iter()
            .map(|column| format!("{column} unresolved")),
    );
    if !plan.unresolved.is_empty() {
        warn!(unresolved = ?plan.unresolved, "requested columns not found in any fragment");
    }
    info!(
        dataset = %plan.dataset,
        domain = %plan.domain,
        fragments = plan.joins.len() + 1,
        rows = table.num_rows(),
        columns = table.num_columns(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "query executed"
    );
    Ok(QueryOutput { table, warnings })
}

fn key_arrays(batch: &RecordBatch, keys: &[String]) -> Result<Vec<ArrayRef>, CellStoreError> {
    keys.iter()
        .map(|key| {
            batch.column_by_name(key).cloned().ok_or_else(|| {
                CellStoreError::Execution(format!("key column {key} missing from batch"))
            })
        })
        .collect()
}

fn null_columns(
    join: &PlannedJoin,
    rows: usize,
) -> Result<Vec<(String, Arc<Field>, ArrayRef)>, CellStoreError> {
    join.columns
        .iter()
        .map(|column| {
            let field = join
                .fragment
                .schema
                .field_with_name(column)
                .map_err(|err| CellStoreError::Execution(err.to_string()))?
                .clone()
                .with_nullable(true);
            let array = new_null_array(field.data_type(), rows);
            Ok((column.clone(), Arc::new(field), array))
        })
        .collect()
}

fn has_null_key(keys: &[ArrayRef], row: usize) -> bool {
    keys.iter().any(|array| array.is_null(row))
}

/// Left-joins one extension onto the base keys. Returns the extension's
/// selected columns aligned to base rows; unmatched rows are null.
fn left_join(
    storage: &dyn StorageBackend,
    base_keys: &[ArrayRef],
    join: &PlannedJoin,
) -> Result<Vec<(String, Arc<Field>, ArrayRef)>, CellStoreError> {
    let mut columns = join.join_keys.clone();
    for column in &join.columns {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }
    let right = storage.read_table(&join.fragment.locator, &columns, &[])?;

    // Align key types with the base so row encodings are comparable.
    let right_keys = key_arrays(&right, &join.join_keys)?
        .into_iter()
        .zip(base_keys)
        .map(|(array, base)| {
            if array.data_type() == base.data_type() {
                Ok(array)
            } else {
                cast(&array, base.data_type()).map_err(|err| {
                    CellStoreError::Execution(format!(
                        "key type mismatch in {}: {err}",
                        join.fragment.locator
                    ))
                })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let converter = RowConverter::new(
        base_keys
            .iter()
            .map(|array| SortField::new(array.data_type().clone()))
            .collect(),
    )
    .map_err(|err| CellStoreError::Execution(err.to_string()))?;
    let right_rows = converter
        .convert_columns(&right_keys)
        .map_err(|err| CellStoreError::Execution(err.to_string()))?;
    let base_rows = converter
        .convert_columns(base_keys)
        .map_err(|err| CellStoreError::Execution(err.to_string()))?;

    let mut lookup: HashMap<Vec<u8>, u32> = HashMap::with_capacity(right_rows.num_rows());
    let mut duplicates = 0usize;
    for row in 0..right_rows.num_rows() {
        if has_null_key(&right_keys, row) {
            continue;
        }
        match lookup.entry(right_rows.row(row).as_ref().to_vec()) {
            Entry::Vacant(slot) => {
                slot.insert(row as u32);
            }
            Entry::Occupied(_) => duplicates += 1,
        }
    }
    if duplicates > 0 {
        warn!(
            locator = %join.fragment.locator,
            duplicates,
            "duplicate join keys; first occurrence wins"
        );
    }

    let indices = (0..base_rows.num_rows())
        .map(|row| {
            if has_null_key(base_keys, row) {
                None
            } else {
                lookup.get(base_rows.row(row).as_ref()).copied()
            }
        })
        .collect::<UInt32Array>();
    debug!(
        locator = %join.fragment.locator,
        matched = indices.len() - indices.null_count(),
        rows = indices.len(),
        "joined extension fragment"
    );

    let schema = right.schema();
    join.columns
        .iter()
        .map(|column| {
            let index = schema
                .index_of(column)
                .map_err(|err| CellStoreError::Execution(err.to_string()))?;
            let field = schema.field(index).clone().with_nullable(true);
            let array = take(right.column(index).as_ref(), &indices, None)
                .map_err(|err| CellStoreError::Execution(err.to_string()))?;
            Ok((column.clone(), Arc::new(field), array))
        })
        .collect()
}
