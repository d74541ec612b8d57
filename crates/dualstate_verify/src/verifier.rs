//! # Verifier
//!
//! Checks content while it is being written, without making the writer wait
//! for the check until it closes.
//!
//! ## Lifecycle
//!
//! ```text
//!  unscheduled ──schedule()──► running ──► succeeded
//!                                 │   └──► failed
//!                                 └─cancel()──► cancelled
//! ```
//!
//! The producer calls [`Verifier::update`] with each completed range, in
//! order, then [`Verifier::end_of_input`], then [`Verifier::finish`] to get
//! the verdict. The validation routine runs on a pool thread and never
//! touches the native side.
//!
//! [`Verifier::NoOp`] is for content produced by trusted code: it accepts
//! every call immediately and never starts a thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{VerifyError, VerifyResult};
use crate::input::{ChunkInput, Feed, MarkRead, Range};
use crate::pool::{panic_message, TaskHandle, WorkerPool};

/// A validation routine.
///
/// Reads the content from `input` and returns `Ok(())` if it is acceptable.
/// It should read to the end: a routine that returns with bytes left over
/// is reported as having finished prematurely.
pub trait Validate: Send + Sync + 'static {
    /// Validates the content readable from `input`.
    fn validate(&self, input: &mut dyn MarkRead) -> VerifyResult<()>;
}

impl<F> Validate for F
where
    F: Fn(&mut dyn MarkRead) -> VerifyResult<()> + Send + Sync + 'static,
{
    fn validate(&self, input: &mut dyn MarkRead) -> VerifyResult<()> {
        self(input)
    }
}

/// Accepts any content, after reading all of it.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl Validate for AcceptAll {
    fn validate(&self, input: &mut dyn MarkRead) -> VerifyResult<()> {
        std::io::copy(input, &mut std::io::sink())?;
        Ok(())
    }
}

/// Observable state of a verifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifierState {
    /// Not yet scheduled.
    Unscheduled,
    /// The routine is running or waiting for input.
    Running,
    /// The routine accepted the content.
    Succeeded,
    /// The routine rejected the content or failed.
    Failed,
    /// The routine was cancelled.
    Cancelled,
}

/// Background content verifier. Cheap to clone; clones share one pipeline.
#[derive(Clone, Default)]
pub enum Verifier {
    /// Accepts everything without doing any work.
    #[default]
    NoOp,
    /// Runs a validation routine on a pool thread.
    Pipeline(Pipeline),
}

type Outcome = VerifyResult<()>;

/// The working variant of [`Verifier`].
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    routine: Arc<dyn Validate>,
    pool: Option<WorkerPool>,
    tx: Sender<Feed>,
    rx: Receiver<Feed>,
    /// Dropping the sender cancels the routine.
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    task: OnceLock<VerifyResult<TaskHandle<Outcome>>>,
    /// Verdict once the routine has returned. Unconsumed input found later
    /// can only turn it into [`VerifyError::Premature`].
    verdict: Mutex<Option<Outcome>>,
}

impl Verifier {
    /// A verifier running `routine` on the process-wide pool.
    pub fn new(routine: impl Validate) -> Self {
        Self::build(Arc::new(routine), None)
    }

    /// A verifier running `routine` on `pool`.
    pub fn with_pool(routine: impl Validate, pool: WorkerPool) -> Self {
        Self::build(Arc::new(routine), Some(pool))
    }

    /// A verifier that reads everything and accepts it.
    #[must_use]
    pub fn accept_all() -> Self {
        Self::new(AcceptAll)
    }

    fn build(routine: Arc<dyn Validate>, pool: Option<WorkerPool>) -> Self {
        let (tx, rx) = unbounded();
        let (cancel_tx, cancel_rx) = unbounded();
        Self::Pipeline(Pipeline {
            inner: Arc::new(Inner {
                routine,
                pool,
                tx,
                rx,
                cancel_tx: Mutex::new(Some(cancel_tx)),
                cancel_rx,
                task: OnceLock::new(),
                verdict: Mutex::new(None),
            }),
        })
    }

    /// True for the no-op variant.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    /// Starts the background task. Later and concurrent calls wait for,
    /// and then observe, the same task.
    pub fn schedule(&self) -> VerifyResult<()> {
        match self {
            Self::NoOp => Ok(()),
            Self::Pipeline(p) => p.schedule(),
        }
    }

    /// Queues the next range.
    ///
    /// Fails with [`VerifyError::Premature`] if the routine has already
    /// returned, or with its stored failure.
    pub fn update(&self, range: Range) -> VerifyResult<()> {
        match self {
            Self::NoOp => Ok(()),
            Self::Pipeline(p) => p.feed(Feed::Range(range)),
        }
    }

    /// Tells the routine no more ranges will arrive.
    pub fn end_of_input(&self) -> VerifyResult<()> {
        match self {
            Self::NoOp => Ok(()),
            Self::Pipeline(p) => p.feed(Feed::NoMore),
        }
    }

    /// Blocks until the routine is done and returns its verdict.
    pub fn finish(&self) -> VerifyResult<()> {
        match self {
            Self::NoOp => Ok(()),
            Self::Pipeline(p) => p.finish(),
        }
    }

    /// Asks the routine to stop. Does not wait.
    pub fn cancel(&self) {
        if let Self::Pipeline(p) = self {
            p.cancel();
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> VerifierState {
        match self {
            Self::NoOp => VerifierState::Succeeded,
            Self::Pipeline(p) => p.state(),
        }
    }
}

impl Pipeline {
    fn schedule(&self) -> VerifyResult<()> {
        let task = self.inner.task.get_or_init(|| {
            let routine = Arc::clone(&self.inner.routine);
            let rx = self.inner.rx.clone();
            let cancel_rx = self.inner.cancel_rx.clone();
            let pool = match &self.inner.pool {
                Some(pool) => pool,
                None => WorkerPool::global(),
            };
            debug!(pool = %pool.config().thread_name_prefix, "verifier scheduled");
            pool.submit(move || run(routine.as_ref(), ChunkInput::new(rx, cancel_rx)))
        });
        task.as_ref().map(drop).map_err(Clone::clone)
    }

    fn task(&self) -> VerifyResult<&TaskHandle<Outcome>> {
        match self.inner.task.get() {
            None => Err(VerifyError::NotScheduled),
            Some(Ok(task)) => Ok(task),
            Some(Err(e)) => Err(e.clone()),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.inner.cancel_tx.lock().is_none()
    }

    fn feed(&self, feed: Feed) -> VerifyResult<()> {
        let returned = self.task()?.is_done();
        if !returned && self.is_cancelled() {
            return Err(VerifyError::Cancelled("verifier was cancelled".to_string()));
        }
        self.inner
            .tx
            .send(feed)
            .map_err(|_| VerifyError::Cancelled("verifier input closed".to_string()))?;
        if returned {
            // Nobody will read it: the verdict counts it as leftover.
            return self.finish();
        }
        Ok(())
    }

    fn finish(&self) -> VerifyResult<()> {
        let outcome = self.task()?.wait().and_then(|outcome| outcome);
        let mut slot = self.inner.verdict.lock();
        let verdict = slot.get_or_insert(outcome);
        // A lone end-of-input marker is not leftover content.
        let leftover = self
            .inner
            .rx
            .try_iter()
            .filter(|feed| matches!(feed, Feed::Range(range) if !range.is_empty()))
            .count();
        if leftover > 0 && verdict.is_ok() {
            *verdict = Err(VerifyError::Premature);
        }
        verdict.clone()
    }

    fn cancel(&self) {
        if self.inner.cancel_tx.lock().take().is_some() {
            debug!("verifier cancelled");
        }
    }

    fn state(&self) -> VerifierState {
        let Ok(task) = self.task() else {
            return VerifierState::Unscheduled;
        };
        let outcome = match self.inner.verdict.lock().clone() {
            Some(verdict) => verdict,
            None => match task.peek() {
                None => return VerifierState::Running,
                Some(result) => result.and_then(|outcome| outcome),
            },
        };
        match outcome {
            Ok(()) => VerifierState::Succeeded,
            Err(VerifyError::Cancelled(_)) => VerifierState::Cancelled,
            Err(_) => VerifierState::Failed,
        }
    }
}

/// Worker entry point.
fn run(routine: &dyn Validate, mut input: ChunkInput) -> Outcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| routine.validate(&mut input)));
    let outcome = match result {
        Err(payload) => Err(VerifyError::Unexpected(panic_message(payload.as_ref()))),
        Ok(_) if input.was_cancelled() => {
            Err(VerifyError::Cancelled("verification cancelled".to_string()))
        }
        Ok(Err(e)) => Err(e),
        Ok(Ok(())) if input.has_unread() => Err(VerifyError::Premature),
        Ok(Ok(())) => Ok(()),
    };
    debug!(ranges = input.ranges_seen(), ok = outcome.is_ok(), "verifier finished");
    outcome
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => f.write_str("Verifier::NoOp"),
            Self::Pipeline(p) => f
                .debug_struct("Verifier::Pipeline")
                .field("state", &p.state())
                .field("queued", &p.inner.rx.len())
                .finish(),
        }
    }
}

impl fmt::Display for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => f.write_str("verifier:noop"),
            Self::Pipeline(p) => write!(f, "verifier:{:?}", p.state()),
        }
    }
}
