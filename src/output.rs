use std::io::{self, Write};

use arrow::json::ArrayWriter;
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use serde::Serialize;
use serde_json::Value;

use crate::backfill::ColumnRequestResult;
use crate::catalog::CatalogSnapshot;
use crate::compactor::CompactionResult;
use crate::domain::DatasetPrefix;
use crate::engine::{CompactOutcome, QueryResponse, ResponseMetadata};
use crate::jobs::JobStatus;
use crate::options::DatasetOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Serialize)]
struct QueryDocument<'a> {
    rows: Value,
    metadata: &'a ResponseMetadata,
    warnings: &'a [String],
}

#[derive(Serialize)]
pub struct StatusReport {
    pub dataset: DatasetPrefix,
    pub status: JobStatus,
}

#[derive(Serialize)]
pub struct GeneCheckReport {
    pub dataset: DatasetPrefix,
    pub found: Vec<String>,
    pub missing: Vec<String>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_query(response: &QueryResponse) -> io::Result<()> {
        Self::print_json(&QueryDocument {
            rows: rows_to_json(&response.rows)?,
            metadata: &response.metadata,
            warnings: &response.warnings,
        })
    }

    pub fn print_compaction(outcome: &CompactOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    pub fn print_catalog(snapshot: &CatalogSnapshot) -> io::Result<()> {
        Self::print_json(snapshot)
    }

    pub fn print_options(options: &DatasetOptions) -> io::Result<()> {
        Self::print_json(options)
    }

    pub fn print_status(report: &StatusReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_gene_check(report: &GeneCheckReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_column_request(result: &ColumnRequestResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Rows as a JSON array of objects; nulls are omitted per row.
pub fn rows_to_json(batch: &RecordBatch) -> io::Result<Value> {
    let mut writer = ArrayWriter::new(Vec::new());
    writer.write(batch).map_err(io::Error::other)?;
    writer.finish().map_err(io::Error::other)?;
    let buffer = writer.into_inner();
    if buffer.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    serde_json::from_slice(&buffer).map_err(io::Error::other)
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_query(response: &QueryResponse) -> io::Result<()> {
        let table = pretty_format_batches(std::slice::from_ref(&response.rows))
            .map_err(io::Error::other)?;
        println!("{table}");
        println!(
            "{} rows x {} columns",
            response.rows.num_rows(),
            response.rows.num_columns()
        );
        Self::print_warnings(&response.warnings);
        Ok(())
    }

    pub fn print_compaction(outcome: &CompactOutcome) {
        match outcome {
            CompactOutcome::Completed(result) => Self::print_compaction_result(result),
            CompactOutcome::Scheduled => println!("compaction scheduled"),
            CompactOutcome::AlreadyRunning => println!("compaction already running"),
        }
    }

    fn print_compaction_result(result: &CompactionResult) {
        println!(
            "{}/{}: merged {} fragment(s), {} new column(s)",
            result.dataset,
            result.domain,
            result.merged.len(),
            result.new_columns
        );
        if result.core_rewritten {
            println!("  core rewritten with {} rows", result.rows);
        }
        if !result.added_columns.is_empty() {
            println!("  added: {}", result.added_columns.join(", "));
        }
        for locator in &result.removed_invalid {
            println!("  removed invalid fragment {locator}");
        }
        for locator in &result.left_in_place {
            println!("  could not delete {locator}; retried on next compaction");
        }
    }

    pub fn print_catalog(snapshot: &CatalogSnapshot) {
        println!(
            "{}/{} ({} storage)",
            snapshot.dataset, snapshot.domain, snapshot.backend
        );
        match &snapshot.core {
            Some(core) => println!("  core  {} [{} columns]", core.locator, core.columns.len()),
            None => println!("  core  <missing>"),
        }
        for fragment in &snapshot.extensions {
            println!(
                "  ext   {} [{}]",
                fragment.locator,
                fragment.columns.join(", ")
            );
        }
        Self::print_warnings(&snapshot.warnings);
    }

    pub fn print_options(options: &DatasetOptions) {
        println!("clusters: {}", options.clusters.join(", "));
        println!("subjects: {}", options.subjects.join(", "));
    }

    pub fn print_status(report: &StatusReport) {
        let status = match report.status {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Ready => "ready",
        };
        println!("{}: {status}", report.dataset);
    }

    pub fn print_gene_check(report: &GeneCheckReport) {
        println!("found:   {}", report.found.join(", "));
        println!("missing: {}", report.missing.join(", "));
    }

    pub fn print_column_request(result: &ColumnRequestResult) {
        println!("available: {}", result.available_now.join(", "));
        println!("pending:   {}", result.pending.join(", "));
        if !result.unknown.is_empty() {
            println!("unknown:   {}", result.unknown.join(", "));
        }
        if result.already_running {
            println!("a backfill for these genes is already running");
        }
    }

    fn print_warnings(warnings: &[String]) {
        for warning in warnings {
            eprintln!("warning: {warning}");
        }
    }
}
