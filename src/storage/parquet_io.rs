//! Parquet <-> Arrow plumbing shared by every backend.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray};
use arrow::compute::{and, cast, concat_batches, filter_record_batch};
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::ChunkReader;

use crate::error::CellStoreError;
use crate::layout::Locator;

/// Membership test on one column: keep rows whose value is in `values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPredicate {
    pub column: String,
    pub values: BTreeSet<String>,
}

impl ColumnPredicate {
    pub fn new(column: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
        Self {
            column: column.into(),
            values: values.into_iter().collect(),
        }
    }
}

/// Reads only the footer; no column chunk is decoded.
pub fn read_schema<R: ChunkReader + 'static>(
    reader: R,
    locator: &Locator,
) -> Result<SchemaRef, CellStoreError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(reader)
        .map_err(|err| CellStoreError::corrupt(locator, err))?;
    Ok(Arc::clone(builder.schema()))
}

/// Reads `columns` (in that order), filtering every decoded batch with
/// `predicates` before it is retained.
pub fn read_table<R: ChunkReader + 'static>(
    reader: R,
    locator: &Locator,
    columns: &[String],
    predicates: &[ColumnPredicate],
) -> Result<RecordBatch, CellStoreError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(reader)
        .map_err(|err| CellStoreError::corrupt(locator, err))?;
    let file_schema = Arc::clone(builder.schema());

    let wanted = columns
        .iter()
        .map(String::as_str)
        .chain(predicates.iter().map(|predicate| predicate.column.as_str()))
        .collect::<BTreeSet<_>>();
    let mut roots = Vec::with_capacity(wanted.len());
    for name in &wanted {
        let index = file_schema.index_of(name).map_err(|_| {
            CellStoreError::Execution(format!("column {name} not present in {locator}"))
        })?;
        roots.push(index);
    }
    roots.sort_unstable();

    let mask = ProjectionMask::roots(builder.parquet_schema(), roots.iter().copied());
    let reader = builder
        .with_projection(mask)
        .build()
        .map_err(|err| CellStoreError::corrupt(locator, err))?;
    let projected: SchemaRef = Arc::new(
        file_schema
            .project(&roots)
            .map_err(|err| CellStoreError::Execution(err.to_string()))?,
    );

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|err| CellStoreError::corrupt(locator, err))?;
        batches.push(apply_predicates(&batch, predicates)?);
    }
    let table = concat_batches(&projected, &batches)
        .map_err(|err| CellStoreError::Execution(err.to_string()))?;

    let order = columns
        .iter()
        .map(|name| {
            table
                .schema()
                .index_of(name)
                .map_err(|err| CellStoreError::Execution(err.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    table
        .project(&order)
        .map_err(|err| CellStoreError::Execution(err.to_string()))
}

pub fn apply_predicates(
    batch: &RecordBatch,
    predicates: &[ColumnPredicate],
) -> Result<RecordBatch, CellStoreError> {
    if predicates.is_empty() {
        return Ok(batch.clone());
    }
    let mut mask: Option<BooleanArray> = None;
    for predicate in predicates {
        let column = batch.column_by_name(&predicate.column).ok_or_else(|| {
            CellStoreError::InvalidFilter(format!("unknown column {}", predicate.column))
        })?;
        let matches = membership(column, &predicate.values)?;
        mask = Some(match mask {
            Some(current) => {
                and(&current, &matches).map_err(|err| CellStoreError::Execution(err.to_string()))?
            }
            None => matches,
        });
    }
    match mask {
        Some(mask) => filter_record_batch(batch, &mask)
            .map_err(|err| CellStoreError::Execution(err.to_string())),
        None => Ok(batch.clone()),
    }
}

fn membership(column: &ArrayRef, values: &BTreeSet<String>) -> Result<BooleanArray, CellStoreError> {
    let strings =
        cast(column, &DataType::Utf8).map_err(|err| CellStoreError::InvalidFilter(err.to_string()))?;
    let strings = strings.as_string::<i32>();
    let hits = (0..strings.len())
        .map(|row| strings.is_valid(row) && values.contains(strings.value(row)))
        .collect::<Vec<_>>();
    Ok(BooleanArray::from(hits))
}

pub fn write_table<W: Write + Send>(writer: W, batch: &RecordBatch) -> Result<(), CellStoreError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    let mut writer = ArrowWriter::try_new(writer, batch.schema(), Some(props))
        .map_err(|err| CellStoreError::Filesystem(format!("parquet writer: {err}")))?;
    writer
        .write(batch)
        .map_err(|err| CellStoreError::Filesystem(format!("parquet write: {err}")))?;
    writer
        .close()
        .map_err(|err| CellStoreError::Filesystem(format!("parquet close: {err}")))?;
    Ok(())
}

pub fn to_bytes(batch: &RecordBatch) -> Result<Vec<u8>, CellStoreError> {
    let mut buffer = Vec::new();
    write_table(&mut buffer, batch)?;
    Ok(buffer)
}

pub fn column_names(schema: &Schema) -> Vec<String> {
    schema.fields().iter().map(|field| field.name().clone()).collect()
}
