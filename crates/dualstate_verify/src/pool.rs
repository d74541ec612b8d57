//! # Verifier Worker Pool
//!
//! A cached, unbounded pool of named OS threads. Verification routines block
//! on their input for as long as a writer keeps producing, so the pool never
//! queues a task behind another one: if no worker is idle, a new one is
//! started. Idle workers exit after the configured keep-alive.
//!
//! ```text
//!  submit(job) ──► jobs channel ──► idle worker?  yes ──► runs job
//!                                        │
//!                                        no ──► spawn "{prefix}-{n}"
//! ```
//!
//! The process-wide pool is created on first use. Processes that never
//! verify anything never start a thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::config::PoolConfig;
use crate::error::{VerifyError, VerifyResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

static GLOBAL: OnceLock<WorkerPool> = OnceLock::new();

/// Pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Threads started since the pool was created.
    pub threads_spawned: u64,
    /// Threads currently alive.
    pub live_threads: usize,
    /// Threads currently waiting for work.
    pub idle_threads: usize,
}

struct PoolShared {
    config: PoolConfig,
    jobs_tx: Sender<Job>,
    jobs_rx: Receiver<Job>,
    /// Waiting workers not yet reserved by a submission. A worker spawned
    /// for a submission starts reserved, a finished job adds one, a
    /// submission or a retirement takes one.
    idle: AtomicUsize,
    live: AtomicUsize,
    spawned: AtomicU64,
}

impl PoolShared {
    /// Claims one idle worker for a job that was just queued.
    fn claim_idle(&self) -> bool {
        self.idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// A worker timed out. It may only leave if its idle slot is still unclaimed.
    fn try_retire(&self) -> bool {
        self.claim_idle()
    }
}

/// Shared handle to a worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Creates a pool. No thread is started until the first submission.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let (jobs_tx, jobs_rx) = unbounded();
        Self {
            shared: Arc::new(PoolShared {
                config,
                jobs_tx,
                jobs_rx,
                idle: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                spawned: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide pool, created with default settings on first use.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| Self::new(PoolConfig::default()))
    }

    /// The process-wide pool, if anything has created it yet.
    pub fn try_global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    /// Creates the process-wide pool from `config`.
    ///
    /// Fails, handing the config back, if the pool already exists.
    pub fn install_global(config: PoolConfig) -> Result<&'static Self, PoolConfig> {
        let mut pending = Some(config);
        let pool = GLOBAL.get_or_init(|| Self::new(pending.take().unwrap_or_default()));
        match pending {
            None => Ok(pool),
            Some(config) => Err(config),
        }
    }

    /// Configuration this pool was created with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Runs `f` on a worker thread.
    ///
    /// A panic inside `f` is caught and reported through the returned handle.
    pub fn submit<T, F>(&self, f: F) -> VerifyResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(Completion::new());
        let done = Arc::clone(&slot);
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(|p| panic_message(p.as_ref()));
            done.complete(result);
        });

        // Reserve a waiter before queueing, so a failed spawn queues nothing.
        if !self.shared.claim_idle() {
            self.spawn_worker()?;
        }
        // The pool holds the receiver, so this cannot fail.
        self.shared
            .jobs_tx
            .send(job)
            .map_err(|_| VerifyError::Pool("job queue closed".to_string()))?;
        Ok(TaskHandle { slot })
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            threads_spawned: self.shared.spawned.load(Ordering::Relaxed),
            live_threads: self.shared.live.load(Ordering::Relaxed),
            idle_threads: self.shared.idle.load(Ordering::Relaxed),
        }
    }

    fn spawn_worker(&self) -> VerifyResult<()> {
        let n = self.shared.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-{n}", self.shared.config.thread_name_prefix);
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = self.shared.config.stack_size {
            builder = builder.stack_size(size);
        }

        self.shared.live.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(&self.shared);
        trace!(thread = %name, "verifier.spawn_worker");
        builder.spawn(move || worker_loop(&shared)).map(drop).map_err(|e| {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
            VerifyError::Pool(format!("failed to start worker {name}: {e}"))
        })
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(shared: &PoolShared) {
    let keep_alive = Duration::from_millis(shared.config.keep_alive_ms);
    loop {
        match shared.jobs_rx.recv_timeout(keep_alive) {
            Ok(job) => {
                job();
                shared.idle.fetch_add(1, Ordering::AcqRel);
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.try_retire() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
    trace!(thread = thread::current().name().unwrap_or("?"), "verifier.retire_worker");
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Completion slot for one submitted job.
struct Completion<T> {
    value: Mutex<Option<Result<T, String>>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<T, String>) {
        *self.value.lock() = Some(result);
        self.ready.notify_all();
    }
}

/// Handle to a job running on a [`WorkerPool`].
pub struct TaskHandle<T> {
    slot: Arc<Completion<T>>,
}

impl<T: Clone> TaskHandle<T> {
    /// Blocks until the job has finished and returns its result.
    ///
    /// A job that panicked yields [`VerifyError::Unexpected`].
    pub fn wait(&self) -> VerifyResult<T> {
        let mut guard = self.slot.value.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone().map_err(VerifyError::Unexpected);
            }
            self.slot.ready.wait(&mut guard);
        }
    }

    /// Waits at most `timeout`. Returns `None` if the job is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<VerifyResult<T>> {
        let mut guard = self.slot.value.lock();
        if guard.is_none() {
            self.slot.ready.wait_for(&mut guard, timeout);
        }
        guard.as_ref().map(|r| r.clone().map_err(VerifyError::Unexpected))
    }

    /// Result so far, without blocking.
    pub fn peek(&self) -> Option<VerifyResult<T>> {
        self.slot
            .value
            .lock()
            .as_ref()
            .map(|r| r.clone().map_err(VerifyError::Unexpected))
    }
}

impl<T> TaskHandle<T> {
    /// True once the job has finished, successfully or not.
    pub fn is_done(&self) -> bool {
        self.slot.value.lock().is_some()
    }
}
