//! The public face of the store: queries, compaction, backfill requests and
//! job status, wired over one shared set of caches.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use arrow::record_batch::RecordBatch;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::backfill::{
    BackfillRunner, ColumnRequestResult, CommandBackfill, Unconfigured, normalize_gene_request,
};
use crate::catalog::{CatalogSnapshot, FragmentCatalog};
use crate::compactor::{CompactionResult, Compactor};
use crate::config::ResolvedConfig;
use crate::domain::{DatasetPrefix, Domain};
use crate::error::CellStoreError;
use crate::executor::{self, QueryOutput};
use crate::jobs::{JobCoordinator, JobKey, JobOutcome, JobState, JobStatus, WorkerPool};
use crate::metadata::{ColorMap, SideMetadata};
use crate::options::{DatasetOptions, OptionsCache};
use crate::planner::{self, QueryPlan, QueryRequest};
use crate::storage::{LocalStore, RemoteStore, StorageBackend, StorageResolver};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub worker_threads: usize,
    pub queue_capacity: usize,
    pub delete_invalid_fragments: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            queue_capacity: 16,
            delete_invalid_fragments: true,
        }
    }
}

impl From<&ResolvedConfig> for EngineSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            worker_threads: config.worker_threads,
            queue_capacity: config.queue_capacity,
            delete_invalid_fragments: config.delete_invalid_fragments,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colors: Option<Arc<ColorMap>>,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub rows: RecordBatch,
    pub metadata: ResponseMetadata,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompactOutcome {
    Completed(CompactionResult),
    /// Queued on the worker pool; poll [`Engine::status`].
    Scheduled,
    AlreadyRunning,
}

struct Services {
    catalog: FragmentCatalog,
    metadata: SideMetadata,
    jobs: JobCoordinator,
    options: OptionsCache,
    compactor: Compactor,
    backfill: Arc<dyn BackfillRunner>,
}

impl Services {
    /// Runs one claimed compaction job to completion and records its outcome.
    /// Caches are invalidated before the job is reported ready.
    fn run_compaction(
        &self,
        key: &JobKey,
        dataset: &DatasetPrefix,
        domain: Domain,
    ) -> Result<CompactionResult, CellStoreError> {
        let outcome = CatalogSnapshot::scan(self.catalog.resolver(), dataset, domain, false)
            .and_then(|snapshot| self.compactor.compact(&snapshot));
        self.catalog.invalidate(dataset, domain);
        match &outcome {
            Ok(_) => {
                self.options.invalidate(dataset, domain);
                self.metadata.invalidate_dataset(dataset);
                self.jobs.mark_done(key, JobOutcome::Succeeded, None);
            }
            Err(err) => {
                error!(dataset = %dataset, domain = %domain, error = %err, "compaction failed");
                self.jobs
                    .mark_done(key, JobOutcome::Failed, Some(err.to_string()));
            }
        }
        outcome
    }

    fn run_backfill(&self, key: &JobKey, dataset: &DatasetPrefix, genes: &[String]) {
        match self.backfill.run(dataset, genes) {
            Ok(()) => {
                self.metadata.invalidate_dataset(dataset);
                self.catalog.invalidate_dataset(dataset);
                self.options.invalidate_dataset(dataset);
                self.jobs.mark_done(key, JobOutcome::Succeeded, None);
            }
            Err(err) => {
                error!(dataset = %dataset, genes = ?genes, error = %err, "backfill failed");
                self.jobs
                    .mark_done(key, JobOutcome::Failed, Some(err.to_string()));
            }
        }
    }
}

/// Cheap to clone; clones share caches, job state and the worker pool.
#[derive(Clone)]
pub struct Engine {
    services: Arc<Services>,
    pool: Arc<WorkerPool>,
}

impl Engine {
    pub fn new(config: &ResolvedConfig) -> Result<Self, CellStoreError> {
        let local: Arc<dyn StorageBackend> = Arc::new(LocalStore::new(config.local_root.clone()));
        let remote = match &config.bucket {
            Some(bucket) => Some(Arc::new(RemoteStore::s3(
                bucket,
                config.remote_prefix.clone(),
                config.cache_dir.clone(),
            )?) as Arc<dyn StorageBackend>),
            None => None,
        };
        let resolver = StorageResolver::new(local, remote, config.force_remote);
        let backfill: Arc<dyn BackfillRunner> = match &config.backfill {
            Some(command) => Arc::new(CommandBackfill::new(command.clone())),
            None => Arc::new(Unconfigured),
        };
        Self::with_parts(resolver, backfill, EngineSettings::from(config))
    }

    pub fn with_parts(
        resolver: StorageResolver,
        backfill: Arc<dyn BackfillRunner>,
        settings: EngineSettings,
    ) -> Result<Self, CellStoreError> {
        let pool = WorkerPool::new(settings.worker_threads, settings.queue_capacity)?;
        Ok(Self {
            services: Arc::new(Services {
                metadata: SideMetadata::new(resolver.clone()),
                catalog: FragmentCatalog::new(resolver),
                jobs: JobCoordinator::new(),
                options: OptionsCache::new(),
                compactor: Compactor::new(settings.delete_invalid_fragments),
                backfill,
            }),
            pool: Arc::new(pool),
        })
    }

    /// Local-only engine without a backfill program.
    pub fn local(
        root: impl Into<camino::Utf8PathBuf>,
        settings: EngineSettings,
    ) -> Result<Self, CellStoreError> {
        let resolver = StorageResolver::local_only(Arc::new(LocalStore::new(root)));
        Self::with_parts(resolver, Arc::new(Unconfigured), settings)
    }

    pub fn catalog(
        &self,
        dataset: &DatasetPrefix,
        domain: Domain,
    ) -> Result<Arc<CatalogSnapshot>, CellStoreError> {
        self.services.catalog.discover(dataset, domain)
    }

    pub fn refresh(
        &self,
        dataset: &DatasetPrefix,
        domain: Domain,
        force_remote: bool,
    ) -> Result<Arc<CatalogSnapshot>, CellStoreError> {
        self.services.options.invalidate(dataset, domain);
        self.services.metadata.invalidate_dataset(dataset);
        self.services.catalog.refresh(dataset, domain, force_remote)
    }

    /// Drops every cached view of `dataset`: fragments, options, gene lists
    /// and the color map. The next call rereads storage.
    pub fn invalidate(&self, dataset: &DatasetPrefix) {
        self.services.catalog.invalidate_dataset(dataset);
        self.services.options.invalidate_dataset(dataset);
        self.services.metadata.invalidate_dataset(dataset);
        info!(dataset = %dataset, "invalidated cached metadata");
    }

    pub fn plan(&self, request: &QueryRequest) -> Result<QueryPlan, CellStoreError> {
        let snapshot = self.catalog(&request.dataset, request.domain)?;
        planner::plan(&snapshot, request)
    }

    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse, CellStoreError> {
        let (snapshot, output) = self.execute(request)?;
        let mut warnings = snapshot.warnings.clone();
        warnings.extend(output.warnings);

        let colors = match self.services.metadata.colors(&request.dataset, false) {
            Ok(colors) if colors.is_empty() => None,
            Ok(colors) => Some(colors),
            Err(err) => {
                warn!(dataset = %request.dataset, error = %err, "color map unavailable");
                warnings.push(format!("color map unavailable: {err}"));
                None
            }
        };
        Ok(QueryResponse {
            rows: output.table,
            metadata: ResponseMetadata { colors },
            warnings,
        })
    }

    /// A fragment planned from a stale snapshot may have been merged away;
    /// such a query is replanned once against a fresh scan.
    fn execute(
        &self,
        request: &QueryRequest,
    ) -> Result<(Arc<CatalogSnapshot>, QueryOutput), CellStoreError> {
        let snapshot = self.catalog(&request.dataset, request.domain)?;
        let plan = planner::plan(&snapshot, request)?;
        match executor::execute(snapshot.storage.as_ref(), &plan) {
            Ok(output) => Ok((snapshot, output)),
            Err(CellStoreError::NotFound(missing)) => {
                warn!(dataset = %request.dataset, missing = %missing, "fragment vanished; rescanning");
                let snapshot =
                    self.services
                        .catalog
                        .refresh(&request.dataset, request.domain, false)?;
                let plan = planner::plan(&snapshot, request)?;
                let output = executor::execute(snapshot.storage.as_ref(), &plan)?;
                Ok((snapshot, output))
            }
            Err(err) => Err(err),
        }
    }

    /// Runs [`Engine::query`] on a helper thread; an expired deadline yields
    /// `Timeout` while the query itself finishes in the background.
    pub fn query_with_deadline(
        &self,
        request: &QueryRequest,
        deadline: Duration,
    ) -> Result<QueryResponse, CellStoreError> {
        let (sender, receiver) = mpsc::channel();
        let engine = self.clone();
        let request = request.clone();
        let started = Instant::now();
        thread::Builder::new()
            .name("cellstore-query".to_string())
            .spawn(move || {
                let _ = sender.send(engine.query(&request));
            })
            .map_err(|err| CellStoreError::Execution(format!("spawn query thread: {err}")))?;
        match receiver.recv_timeout(deadline) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(elapsed_ms = started.elapsed().as_millis() as u64, "query deadline expired");
                Err(CellStoreError::Timeout(deadline.as_millis() as u64))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CellStoreError::Execution(
                "query thread exited without a result".to_string(),
            )),
        }
    }

    /// Compacts on the calling thread. The caller receives the result
    /// directly, so the job's ready signal is consumed here.
    pub fn compact(
        &self,
        dataset: &DatasetPrefix,
        domain: Domain,
    ) -> Result<CompactOutcome, CellStoreError> {
        let key = JobKey::compaction(dataset, domain);
        if self.services.jobs.submit(&key).already_running() {
            info!(dataset = %dataset, domain = %domain, "compaction already running");
            return Ok(CompactOutcome::AlreadyRunning);
        }
        let result = self.services.run_compaction(&key, dataset, domain)?;
        self.services.jobs.acknowledge(&key);
        Ok(CompactOutcome::Completed(result))
    }

    pub fn compact_in_background(
        &self,
        dataset: &DatasetPrefix,
        domain: Domain,
    ) -> Result<CompactOutcome, CellStoreError> {
        let key = JobKey::compaction(dataset, domain);
        if self.services.jobs.submit(&key).already_running() {
            return Ok(CompactOutcome::AlreadyRunning);
        }
        let services = Arc::clone(&self.services);
        let task_key = key.clone();
        let task_dataset = dataset.clone();
        let spawned = self.pool.spawn(move || {
            let _ = services.run_compaction(&task_key, &task_dataset, domain);
        });
        if let Err(err) = spawned {
            self.services
                .jobs
                .mark_done(&key, JobOutcome::Failed, Some(err.to_string()));
            return Err(err);
        }
        info!(dataset = %dataset, domain = %domain, "compaction scheduled");
        Ok(CompactOutcome::Scheduled)
    }

    /// Compacts each dataset in turn; one failure does not stop the rest.
    pub fn compact_all(
        &self,
        datasets: &[DatasetPrefix],
        domain: Domain,
    ) -> Vec<(DatasetPrefix, Result<CompactOutcome, CellStoreError>)> {
        datasets
            .iter()
            .map(|dataset| {
                let outcome = self.compact(dataset, domain);
                if let Err(err) = &outcome {
                    warn!(dataset = %dataset, domain = %domain, error = %err, "skipping dataset");
                }
                (dataset.clone(), outcome)
            })
            .collect()
    }

    /// Splits `columns` into genes queryable now and genes handed to the
    /// backfill producer. Only one producer run per gene set is in flight.
    pub fn request_columns(
        &self,
        dataset: &DatasetPrefix,
        columns: &[String],
    ) -> Result<ColumnRequestResult, CellStoreError> {
        let genes = normalize_gene_request(columns, None);
        let (available_now, missing) =
            self.services
                .metadata
                .check_availability(dataset, &genes, false)?;
        let universe = self.services.metadata.gene_universe(dataset, false)?;
        let (pending, unknown): (Vec<String>, Vec<String>) = if universe.is_empty() {
            (missing, Vec::new())
        } else {
            missing.into_iter().partition(|gene| universe.contains(gene))
        };
        if !unknown.is_empty() {
            warn!(dataset = %dataset, unknown = ?unknown, "genes not in the gene universe");
        }

        let mut result = ColumnRequestResult {
            available_now,
            pending,
            unknown,
            already_running: false,
        };
        if result.pending.is_empty() {
            return Ok(result);
        }

        let key = JobKey::backfill(dataset, result.pending.iter().cloned());
        if self.services.jobs.submit(&key).already_running() {
            info!(dataset = %dataset, genes = ?result.pending, "backfill already running");
            result.already_running = true;
            return Ok(result);
        }
        let services = Arc::clone(&self.services);
        let task_key = key.clone();
        let task_dataset = dataset.clone();
        let genes = result.pending.clone();
        let spawned = self.pool.spawn(move || {
            services.run_backfill(&task_key, &task_dataset, &genes);
        });
        if let Err(err) = spawned {
            self.services
                .jobs
                .mark_done(&key, JobOutcome::Failed, Some(err.to_string()));
            return Err(err);
        }
        info!(dataset = %dataset, genes = ?result.pending, "backfill scheduled");
        Ok(result)
    }

    pub fn status(&self, dataset: &DatasetPrefix) -> JobStatus {
        self.services.jobs.dataset_status(dataset)
    }

    pub fn job_status(&self, key: &JobKey) -> JobStatus {
        self.services.jobs.status(key)
    }

    pub fn job_state(&self, key: &JobKey) -> Option<JobState> {
        self.services.jobs.state(key)
    }

    /// Polls until no job for `dataset` is running or `timeout` passes.
    pub fn wait_while_running(&self, dataset: &DatasetPrefix, timeout: Duration) -> JobStatus {
        let started = Instant::now();
        loop {
            let status = self.status(dataset);
            if status != JobStatus::Running || started.elapsed() >= timeout {
                return status;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Consumes every ready signal for `dataset`; returns how many there were.
    pub fn acknowledge(&self, dataset: &DatasetPrefix) -> usize {
        self.services.jobs.acknowledge_dataset(dataset)
    }

    pub fn options(
        &self,
        dataset: &DatasetPrefix,
        domain: Domain,
    ) -> Result<Arc<DatasetOptions>, CellStoreError> {
        let snapshot = self.catalog(dataset, domain)?;
        self.services.options.get_or_load(&snapshot)
    }

    pub fn colors(
        &self,
        dataset: &DatasetPrefix,
        force_remote: bool,
    ) -> Result<Arc<ColorMap>, CellStoreError> {
        self.services.metadata.colors(dataset, force_remote)
    }

    pub fn gene_list(
        &self,
        dataset: &DatasetPrefix,
        force_remote: bool,
    ) -> Result<Arc<Vec<String>>, CellStoreError> {
        self.services
            .metadata
            .gene_list(dataset, Domain::Gex, force_remote)
    }

    pub fn gene_universe(
        &self,
        dataset: &DatasetPrefix,
        force_remote: bool,
    ) -> Result<Vec<String>, CellStoreError> {
        self.services.metadata.gene_universe(dataset, force_remote)
    }

    pub fn check_availability(
        &self,
        dataset: &DatasetPrefix,
        genes: &[String],
        force_remote: bool,
    ) -> Result<(Vec<String>, Vec<String>), CellStoreError> {
        self.services
            .metadata
            .check_availability(dataset, genes, force_remote)
    }
}
