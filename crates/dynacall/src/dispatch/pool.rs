//! Worker pool for asynchronous native calls
//!
//! One process-wide tokio runtime whose blocking pool is capped at the
//! configured number of worker threads. Native calls are blocking work, so
//! every job goes through `spawn_blocking`; the runtime's single async worker
//! only exists to drive the pool.

use crate::config;
use crate::error::RuntimeError;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::OnceLock;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

static WORKER_POOL: OnceLock<Result<WorkerPool, RuntimeError>> = OnceLock::new();

/// Job ID counter, used in logs only
static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) struct WorkerPool {
    runtime: Runtime,
    threads: usize,
}

impl WorkerPool {
    fn new(threads: usize) -> Result<Self, RuntimeError> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("dynacall-worker")
            .build()
            .map_err(|e| RuntimeError::WorkerPool(e.to_string()))?;
        log::debug!("started worker pool with {} thread(s)", threads);
        Ok(Self { runtime, threads })
    }

    pub(crate) fn threads(&self) -> usize {
        self.threads
    }

    /// Queue `job` on a worker thread
    pub(crate) fn submit<F>(&self, job: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.runtime.spawn_blocking(job)
    }
}

/// The process-wide pool, started on first use
pub(crate) fn worker_pool() -> Result<&'static WorkerPool, RuntimeError> {
    WORKER_POOL
        .get_or_init(|| WorkerPool::new(config::global().worker_threads()))
        .as_ref()
        .map_err(Clone::clone)
}

/// Size of the worker pool, starting it if needed
pub fn worker_threads() -> Result<usize, RuntimeError> {
    worker_pool().map(WorkerPool::threads)
}

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Status of one submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for a worker
    Queued,
    /// Handed to native code; can no longer be stopped
    Running,
    /// Withdrawn before a worker picked it up
    Cancelled,
}

/// Shared between a job and whoever may cancel it
///
/// Exactly one of [`Ticket::start`] and [`Ticket::cancel`] wins.
#[derive(Debug)]
pub(crate) struct Ticket {
    id: u64,
    state: AtomicU8,
}

impl Ticket {
    pub(crate) fn new() -> Self {
        Self {
            id: JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(QUEUED),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Claim the job for a worker; false if it was cancelled first
    pub(crate) fn start(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Withdraw the job; false if a worker already started it
    pub(crate) fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CANCELLED,
        }
    }

    pub(crate) fn status(&self) -> JobStatus {
        match self.state.load(Ordering::Acquire) {
            QUEUED => JobStatus::Queued,
            RUNNING => JobStatus::Running,
            _ => JobStatus::Cancelled,
        }
    }
}
