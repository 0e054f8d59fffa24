use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use cellstore::backfill::normalize_gene_request;
use cellstore::config::{ConfigLoader, ResolvedConfig};
use cellstore::domain::{ColumnSelection, DatasetPrefix, Domain};
use cellstore::engine::Engine;
use cellstore::error::CellStoreError;
use cellstore::output::{GeneCheckReport, JsonOutput, OutputMode, StatusReport, TextOutput};
use cellstore::planner::{QueryRequest, RowFilters};

#[derive(Parser)]
#[command(name = "cellstore")]
#[command(about = "Query and compact fragmented single-cell Parquet datasets")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./cellstore.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Read from the object store even when a local copy exists
    #[arg(long, global = true)]
    force_remote: bool,

    /// Machine-readable output on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Query columns across core and extension fragments")]
    Query(QueryArgs),
    #[command(about = "Merge extension fragments into the core fragment")]
    Compact(CompactArgs),
    #[command(about = "List the fragments and columns of a dataset")]
    Schema(TargetArgs),
    #[command(about = "List cluster and subject filter values")]
    Options(TargetArgs),
    #[command(about = "Gene availability and backfill requests")]
    Genes(GenesArgs),
    #[command(
        about = "Show background job status for a dataset",
        long_about = "Show background job status for a dataset. Job state lives in memory of \
                      the process that started the job, so a separate invocation reports idle; \
                      `genes request` prints the final status of its own backfill."
    )]
    Status(StatusArgs),
}

#[derive(Args)]
struct TargetArgs {
    dataset: String,

    #[arg(long, value_enum, default_value = "gex")]
    domain: Domain,
}

#[derive(Args)]
struct QueryArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Columns to select; omit or pass `*` for all
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    cluster: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    subject: Vec<String>,

    /// Print the query plan instead of running it
    #[arg(long)]
    explain: bool,
}

#[derive(Args)]
struct CompactArgs {
    /// One or more datasets; each is compacted in turn
    #[arg(required = true)]
    datasets: Vec<String>,

    #[arg(long, value_enum, default_value = "gex")]
    domain: Domain,
}

#[derive(Args)]
struct GenesArgs {
    #[command(subcommand)]
    command: GenesCommand,
}

#[derive(Subcommand)]
enum GenesCommand {
    #[command(about = "Split genes into already extracted and missing")]
    Check(GeneListArgs),
    #[command(about = "Start a backfill for missing genes and wait for it")]
    Request(GeneListArgs),
}

#[derive(Args)]
struct GeneListArgs {
    dataset: String,

    /// Genes, comma or space separated
    #[arg(required = true, num_args = 1..)]
    genes: Vec<String>,
}

#[derive(Args)]
struct StatusArgs {
    dataset: String,
}

const BACKFILL_WAIT: Duration = Duration::from_secs(60 * 60);

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CellStoreError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CellStoreError) -> u8 {
    match error {
        CellStoreError::NotFound(_)
        | CellStoreError::InvalidDataset(_)
        | CellStoreError::InvalidDomain(_)
        | CellStoreError::InvalidFilter(_)
        | CellStoreError::MissingBucket => 2,
        CellStoreError::BackendUnavailable(_)
        | CellStoreError::Timeout(_)
        | CellStoreError::QueueFull
        | CellStoreError::Backfill(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    config.force_remote |= cli.force_remote;
    let engine = Engine::new(&config)?;

    match cli.command {
        Commands::Query(args) => run_query(&engine, &config, args, mode),
        Commands::Compact(args) => run_compact(&engine, args, mode),
        Commands::Schema(args) => {
            let dataset = args.dataset.parse::<DatasetPrefix>()?;
            let snapshot = engine.catalog(&dataset, args.domain)?;
            match mode {
                OutputMode::Json => JsonOutput::print_catalog(&snapshot).into_diagnostic()?,
                OutputMode::Human => TextOutput::print_catalog(&snapshot),
            }
            Ok(())
        }
        Commands::Options(args) => {
            let dataset = args.dataset.parse::<DatasetPrefix>()?;
            let options = engine.options(&dataset, args.domain)?;
            match mode {
                OutputMode::Json => JsonOutput::print_options(&options).into_diagnostic()?,
                OutputMode::Human => TextOutput::print_options(&options),
            }
            Ok(())
        }
        Commands::Genes(args) => run_genes(&engine, &config, args, mode),
        Commands::Status(args) => {
            let dataset = args.dataset.parse::<DatasetPrefix>()?;
            let report = StatusReport {
                status: engine.status(&dataset),
                dataset,
            };
            match mode {
                OutputMode::Json => JsonOutput::print_status(&report).into_diagnostic()?,
                OutputMode::Human => TextOutput::print_status(&report),
            }
            Ok(())
        }
    }
}

fn run_query(
    engine: &Engine,
    config: &ResolvedConfig,
    args: QueryArgs,
    mode: OutputMode,
) -> miette::Result<()> {
    let dataset = args.target.dataset.parse::<DatasetPrefix>()?;
    let domain = args.target.domain;
    let request = QueryRequest::new(dataset, domain, ColumnSelection::parse_list(&args.columns))
        .with_filters(RowFilters::from_api(domain, &args.cluster, &args.subject));

    if args.explain {
        let plan = engine.plan(&request)?;
        match mode {
            OutputMode::Json => {
                let json = serde_json::to_string_pretty(&plan).into_diagnostic()?;
                println!("{json}");
            }
            OutputMode::Human => print!("{plan}"),
        }
        return Ok(());
    }

    let response = match config.query_timeout {
        Some(deadline) => engine.query_with_deadline(&request, deadline)?,
        None => engine.query(&request)?,
    };
    match mode {
        OutputMode::Json => JsonOutput::print_query(&response).into_diagnostic()?,
        OutputMode::Human => TextOutput::print_query(&response).into_diagnostic()?,
    }
    Ok(())
}

fn run_compact(engine: &Engine, args: CompactArgs, mode: OutputMode) -> miette::Result<()> {
    let datasets = args
        .datasets
        .iter()
        .map(|dataset| dataset.parse::<DatasetPrefix>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut first_error = None;
    for (dataset, outcome) in engine.compact_all(&datasets, args.domain) {
        match outcome {
            Ok(outcome) => match mode {
                OutputMode::Json => JsonOutput::print_compaction(&outcome).into_diagnostic()?,
                OutputMode::Human => TextOutput::print_compaction(&outcome),
            },
            Err(err) => {
                eprintln!("{dataset}: {err}");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn run_genes(
    engine: &Engine,
    config: &ResolvedConfig,
    args: GenesArgs,
    mode: OutputMode,
) -> miette::Result<()> {
    match args.command {
        GenesCommand::Check(args) => {
            let dataset = args.dataset.parse::<DatasetPrefix>()?;
            let genes = normalize_gene_request(&[], Some(&args.genes.join(" ")));
            let (found, missing) =
                engine.check_availability(&dataset, &genes, config.force_remote)?;
            let report = GeneCheckReport {
                dataset,
                found,
                missing,
            };
            match mode {
                OutputMode::Json => JsonOutput::print_gene_check(&report).into_diagnostic()?,
                OutputMode::Human => TextOutput::print_gene_check(&report),
            }
            Ok(())
        }
        GenesCommand::Request(args) => {
            let dataset = args.dataset.parse::<DatasetPrefix>()?;
            let genes = normalize_gene_request(&[], Some(&args.genes.join(" ")));
            let result = engine.request_columns(&dataset, &genes)?;
            match mode {
                OutputMode::Json => JsonOutput::print_column_request(&result).into_diagnostic()?,
                OutputMode::Human => TextOutput::print_column_request(&result),
            }
            if !result.pending.is_empty() {
                let status = engine.wait_while_running(&dataset, BACKFILL_WAIT);
                let report = StatusReport { dataset, status };
                match mode {
                    OutputMode::Json => JsonOutput::print_status(&report).into_diagnostic()?,
                    OutputMode::Human => TextOutput::print_status(&report),
                }
            }
            Ok(())
        }
    }
}
