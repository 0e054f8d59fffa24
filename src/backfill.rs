//! Extraction of genes that no fragment carries yet. The producer is an
//! external program; it writes new extension fragments and refreshes the
//! gene list, and this crate only launches it and tracks the outcome.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BackfillCommand;
use crate::domain::DatasetPrefix;
use crate::error::CellStoreError;

pub const PREFIX_ENV: &str = "EXTRACT_PREFIX";
pub const GENES_ENV: &str = "EXTRACT_GENES";

static GENE_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,\s]+").expect("static regex"));

pub trait BackfillRunner: Send + Sync {
    /// Blocks until the producer has finished for `genes`.
    fn run(&self, dataset: &DatasetPrefix, genes: &[String]) -> Result<(), CellStoreError>;
}

/// Runs the configured program with `EXTRACT_PREFIX` / `EXTRACT_GENES` set.
#[derive(Debug, Clone)]
pub struct CommandBackfill {
    command: BackfillCommand,
}

impl CommandBackfill {
    pub fn new(command: BackfillCommand) -> Self {
        Self { command }
    }
}

impl BackfillRunner for CommandBackfill {
    fn run(&self, dataset: &DatasetPrefix, genes: &[String]) -> Result<(), CellStoreError> {
        let program = self.command.program.display().to_string();
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .env(PREFIX_ENV, dataset.as_str())
            .env(GENES_ENV, genes.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CellStoreError::Backfill(format!("spawn {program}: {err}")))?;
        info!(dataset = %dataset, genes = ?genes, pid = child.id(), "backfill process started");

        let stderr = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    if !line.trim().is_empty() {
                        warn!(target: "backfill", "{}", line.trim());
                    }
                }
            })
        });
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if !line.trim().is_empty() {
                    info!(target: "backfill", "{}", line.trim());
                }
            }
        }
        if let Some(handle) = stderr {
            let _ = handle.join();
        }

        let status = child
            .wait()
            .map_err(|err| CellStoreError::Backfill(format!("wait for {program}: {err}")))?;
        if status.success() {
            info!(dataset = %dataset, "backfill process finished");
            Ok(())
        } else {
            Err(CellStoreError::Backfill(format!("{program} exited with {status}")))
        }
    }
}

/// Runner used when no backfill program is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

impl BackfillRunner for Unconfigured {
    fn run(&self, _dataset: &DatasetPrefix, _genes: &[String]) -> Result<(), CellStoreError> {
        Err(CellStoreError::Backfill(
            "no backfill program configured".to_string(),
        ))
    }
}

/// Combines dropdown picks with free text: split on commas or whitespace,
/// uppercased, first occurrence order kept.
pub fn normalize_gene_request(selected: &[String], typed: Option<&str>) -> Vec<String> {
    let mut genes: Vec<String> = Vec::new();
    let typed = typed.unwrap_or_default();
    let candidates = selected
        .iter()
        .map(|gene| gene.trim().to_uppercase())
        .chain(GENE_SEPARATOR.split(typed).map(|gene| gene.trim().to_uppercase()));
    for gene in candidates {
        if !gene.is_empty() && !genes.contains(&gene) {
            genes.push(gene);
        }
    }
    genes
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColumnRequestResult {
    /// Already extracted; queryable right away.
    pub available_now: Vec<String>,
    /// Handed to the producer; poll `status` for readiness.
    pub pending: Vec<String>,
    /// Not in the gene universe; never requested.
    pub unknown: Vec<String>,
    pub already_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_combines_and_dedupes() {
        let selected = vec!["CD4".to_string(), "cd8a".to_string()];
        let genes = normalize_gene_request(&selected, Some("foxp3, CD4  il2ra,,"));
        assert_eq!(genes, vec!["CD4", "CD8A", "FOXP3", "IL2RA"]);
        assert!(normalize_gene_request(&[], Some("  ")).is_empty());
        assert_eq!(normalize_gene_request(&selected, None), vec!["CD4", "CD8A"]);
    }

    #[test]
    fn unconfigured_runner_fails() {
        let dataset: DatasetPrefix = "tcell".parse().unwrap();
        let result = Unconfigured.run(&dataset, &["CD4".to_string()]);
        assert!(matches!(result, Err(CellStoreError::Backfill(_))));
    }

    #[cfg(unix)]
    #[test]
    fn command_receives_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("env.txt");
        let command = BackfillCommand {
            program: "sh".into(),
            args: vec![
                "-c".to_string(),
                format!("echo \"$EXTRACT_PREFIX:$EXTRACT_GENES\" > {}", out.display()),
            ],
        };
        let dataset: DatasetPrefix = "tcell".parse().unwrap();
        CommandBackfill::new(command)
            .run(&dataset, &["CD4".to_string(), "FOXP3".to_string()])
            .unwrap();
        let written = std::fs::read_to_string(out).unwrap();
        assert_eq!(written.trim(), "tcell:CD4,FOXP3");

        let failing = BackfillCommand {
            program: "sh".into(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
        };
        assert!(CommandBackfill::new(failing).run(&dataset, &[]).is_err());
    }
}
