//! Single-flight job bookkeeping and the bounded background worker pool.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::domain::{DatasetPrefix, Domain};
use crate::error::CellStoreError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobKey {
    Compaction {
        dataset: DatasetPrefix,
        domain: Domain,
    },
    Backfill {
        dataset: DatasetPrefix,
        columns: Vec<String>,
    },
}

impl JobKey {
    pub fn compaction(dataset: &DatasetPrefix, domain: Domain) -> Self {
        JobKey::Compaction {
            dataset: dataset.clone(),
            domain,
        }
    }

    /// Column order and duplicates do not change the key.
    pub fn backfill(dataset: &DatasetPrefix, columns: impl IntoIterator<Item = String>) -> Self {
        let mut columns = columns.into_iter().collect::<Vec<_>>();
        columns.sort();
        columns.dedup();
        JobKey::Backfill {
            dataset: dataset.clone(),
            columns,
        }
    }

    pub fn dataset(&self) -> &DatasetPrefix {
        match self {
            JobKey::Compaction { dataset, .. } | JobKey::Backfill { dataset, .. } => dataset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Started,
    AlreadyRunning,
}

impl Submission {
    pub fn already_running(self) -> bool {
        self == Submission::AlreadyRunning
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

type Shard = Arc<Mutex<HashMap<JobKey, JobState>>>;

/// Per-key state machine `idle -> running -> ready -> idle`; a failed run
/// goes straight back to `idle`. State is sharded by dataset.
#[derive(Debug, Default)]
pub struct JobCoordinator {
    shards: Mutex<HashMap<DatasetPrefix, Shard>>,
}

impl JobCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, dataset: &DatasetPrefix) -> Shard {
        let mut shards = self.shards.lock();
        Arc::clone(shards.entry(dataset.clone()).or_default())
    }

    /// Claims `key`. A pending `ready` signal for the same key is consumed:
    /// the key moves `ready -> running` directly, with no `idle` step in
    /// between, so a poller waiting on the earlier run never sees it finish.
    /// Acknowledge first when that signal matters.
    pub fn submit(&self, key: &JobKey) -> Submission {
        let shard = self.shard(key.dataset());
        let mut jobs = shard.lock();
        if let Some(state) = jobs.get(key) {
            if state.status == JobStatus::Running {
                debug!(key = ?key, "job already running");
                return Submission::AlreadyRunning;
            }
        }
        jobs.insert(
            key.clone(),
            JobState {
                status: JobStatus::Running,
                updated_at: Utc::now(),
                last_error: None,
            },
        );
        info!(key = ?key, "job started");
        Submission::Started
    }

    pub fn mark_done(&self, key: &JobKey, outcome: JobOutcome, error: Option<String>) {
        let shard = self.shard(key.dataset());
        let mut jobs = shard.lock();
        let Some(state) = jobs.get_mut(key) else {
            warn!(key = ?key, "mark_done for unknown job");
            return;
        };
        if state.status != JobStatus::Running {
            warn!(key = ?key, status = ?state.status, "mark_done for job that is not running");
            return;
        }
        state.status = match outcome {
            JobOutcome::Succeeded => JobStatus::Ready,
            JobOutcome::Failed => JobStatus::Idle,
        };
        state.updated_at = Utc::now();
        state.last_error = error;
        info!(key = ?key, status = ?state.status, "job finished");
    }

    pub fn status(&self, key: &JobKey) -> JobStatus {
        let shard = self.shard(key.dataset());
        let jobs = shard.lock();
        jobs.get(key)
            .map(|state| state.status)
            .unwrap_or(JobStatus::Idle)
    }

    pub fn state(&self, key: &JobKey) -> Option<JobState> {
        let shard = self.shard(key.dataset());
        let jobs = shard.lock();
        jobs.get(key).cloned()
    }

    /// Aggregate for polling callers: running beats ready beats idle.
    pub fn dataset_status(&self, dataset: &DatasetPrefix) -> JobStatus {
        let shard = self.shard(dataset);
        let jobs = shard.lock();
        let mut status = JobStatus::Idle;
        for state in jobs.values() {
            match state.status {
                JobStatus::Running => return JobStatus::Running,
                JobStatus::Ready => status = JobStatus::Ready,
                JobStatus::Idle => {}
            }
        }
        status
    }

    /// Consumes a `ready` signal (`ready -> idle`); other states are left alone.
    pub fn acknowledge(&self, key: &JobKey) -> bool {
        let shard = self.shard(key.dataset());
        let mut jobs = shard.lock();
        match jobs.get_mut(key) {
            Some(state) if state.status == JobStatus::Ready => {
                state.status = JobStatus::Idle;
                state.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn acknowledge_dataset(&self, dataset: &DatasetPrefix) -> usize {
        let shard = self.shard(dataset);
        let mut jobs = shard.lock();
        let mut consumed = 0;
        for state in jobs.values_mut() {
            if state.status == JobStatus::Ready {
                state.status = JobStatus::Idle;
                state.updated_at = Utc::now();
                consumed += 1;
            }
        }
        consumed
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads fed through a bounded queue.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<SyncSender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize, queue_capacity: usize) -> Result<Self, CellStoreError> {
        let (sender, receiver) = mpsc::sync_channel::<Task>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("cellstore-worker-{index}"))
                .spawn(move || worker_loop(&receiver))
                .map_err(|err| CellStoreError::Filesystem(format!("spawn worker: {err}")))?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn spawn<F>(&self, task: F) -> Result<(), CellStoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| CellStoreError::Execution("worker pool is shut down".to_string()))?;
        sender.try_send(Box::new(task)).map_err(|err| match err {
            TrySendError::Full(_) => CellStoreError::QueueFull,
            TrySendError::Disconnected(_) => {
                CellStoreError::Execution("worker pool is shut down".to_string())
            }
        })
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Task>>) {
    loop {
        let task = receiver.lock().recv();
        let Ok(task) = task else {
            break;
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("background task panicked");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
