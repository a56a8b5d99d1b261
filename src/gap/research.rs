//! Research execution.
//!
//! A [`Researcher`] turns a gap into candidate claims. The
//! [`ResearchRuntime`] runs researchers on a bounded pool of worker threads
//! and feeds their candidates through the normal commit pipeline, checking
//! a cancellation flag before each commit. Claims committed before a
//! cancellation stay committed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult, RailViolation};
use crate::gap::{GapId, GapKind, GapTarget};
use crate::ingest::{CandidateClaim, CommitPipeline, CommitReceipt, ConsistencyMode};

/// What research is asked to find.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchRequest {
    /// Gap being researched.
    pub gap: GapId,
    /// What kind of knowledge is missing.
    pub kind: GapKind,
    /// Entity or fact the gap is about.
    pub target: GapTarget,
    /// Human-readable query.
    pub query: String,
    /// Domains research may consult.
    pub domains: Vec<String>,
    /// Recursion depth of the gap.
    pub depth: u32,
}

/// Raw research output: candidates in the order they should be tried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchFindings {
    /// Candidate claims, committed in order.
    pub candidates: Vec<CandidateClaim>,
    /// Sources actually consulted, for the audit trail.
    pub sources_consulted: Vec<String>,
}

/// A researcher failure. Transient failures are retried within the gap's
/// attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ResearchError {
    /// What went wrong.
    pub message: String,
    /// Whether another attempt may succeed.
    pub transient: bool,
}

impl ResearchError {
    /// A failure worth retrying, such as a timeout upstream.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// A failure that retrying will not fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl From<ResearchError> for GraphError {
    fn from(err: ResearchError) -> Self {
        Self::Research {
            message: err.message,
            transient: err.transient,
        }
    }
}

/// The external research collaborator.
pub trait Researcher: Send + Sync {
    /// Finds candidate claims for a gap.
    ///
    /// # Errors
    ///
    /// A `ResearchError`; mark it transient if retrying may help.
    fn research(&self, request: &ResearchRequest) -> Result<ResearchFindings, ResearchError>;
}

impl<F> Researcher for F
where
    F: Fn(&ResearchRequest) -> Result<ResearchFindings, ResearchError> + Send + Sync,
{
    fn research(&self, request: &ResearchRequest) -> Result<ResearchFindings, ResearchError> {
        self(request)
    }
}

/// Stand-in used when no collaborator is attached; every call fails
/// permanently.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedResearcher;

impl Researcher for DetachedResearcher {
    fn research(&self, _request: &ResearchRequest) -> Result<ResearchFindings, ResearchError> {
        Err(ResearchError::permanent("no research collaborator attached"))
    }
}

/// What one research task did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResearchReport {
    /// Sources the researcher consulted.
    pub sources_consulted: Vec<String>,
    /// Receipts of the candidates that committed.
    pub committed: Vec<CommitReceipt>,
    /// Candidates refused by validation or conflict checks.
    pub refused: usize,
    /// Set when the task stopped early because it was cancelled.
    pub cancelled: bool,
}

type Reply = Result<ResearchReport, ResearchError>;

/// A reserved concurrency slot, released on drop.
#[derive(Debug)]
pub struct ResearchPermit {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ResearchPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Job {
    request: ResearchRequest,
    researcher: Arc<dyn Researcher>,
    pipeline: Arc<CommitPipeline>,
    mode: ConsistencyMode,
    cancel: Arc<AtomicBool>,
    reply: Sender<Reply>,
    _permit: ResearchPermit,
}

fn run_job(job: &Job) -> Reply {
    let findings = job.researcher.research(&job.request)?;
    let mut report = ResearchReport {
        sources_consulted: findings.sources_consulted,
        ..ResearchReport::default()
    };
    for candidate in &findings.candidates {
        if job.cancel.load(Ordering::Acquire) {
            report.cancelled = true;
            break;
        }
        match job.pipeline.submit(candidate, job.mode) {
            Ok(receipt) => report.committed.push(receipt),
            Err(e) if e.is_validation() || e.is_conflict() => {
                debug!(gap = %job.request.gap, error = %e, "research candidate refused");
                report.refused += 1;
            }
            Err(e) => {
                warn!(gap = %job.request.gap, error = %e, "research candidate failed");
                report.refused += 1;
            }
        }
    }
    Ok(report)
}

/// Handle to one running research task.
pub struct ResearchHandle {
    gap: GapId,
    rx: Receiver<Reply>,
    cancel: Arc<AtomicBool>,
}

impl fmt::Debug for ResearchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResearchHandle")
            .field("gap", &self.gap)
            .field("cancelled", &self.cancel.load(Ordering::Relaxed))
            .finish()
    }
}

impl ResearchHandle {
    /// Gap the task is researching.
    #[must_use]
    pub const fn gap(&self) -> GapId {
        self.gap
    }

    /// Stops the task before its next commit.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Waits up to `timeout`, cancelling the task if it has not finished.
    ///
    /// # Errors
    ///
    /// - `ResearchTimeout` if the task did not finish in time.
    /// - `Research` if the researcher failed or its worker died.
    pub fn wait(self, timeout: Duration) -> GraphResult<ResearchReport> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => reply.map_err(GraphError::from),
            Err(RecvTimeoutError::Timeout) => {
                self.cancel();
                Err(GraphError::ResearchTimeout {
                    gap: self.gap,
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(ResearchError::permanent("research worker exited without a result").into())
            }
        }
    }
}

/// Bounded research worker pool.
pub struct ResearchRuntime {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    limit: usize,
}

impl fmt::Debug for ResearchRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResearchRuntime")
            .field("workers", &self.workers.len())
            .field("in_flight", &self.in_flight())
            .field("limit", &self.limit)
            .finish()
    }
}

impl ResearchRuntime {
    /// Starts `concurrency` workers.
    ///
    /// # Errors
    ///
    /// `Internal` if a worker thread cannot be spawned.
    pub fn start(concurrency: usize) -> GraphResult<Self> {
        let limit = concurrency.max(1);
        let (tx, rx) = bounded::<Job>(limit);

        let mut workers = Vec::with_capacity(limit);
        for idx in 0..limit {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("kyrograph-research-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let reply = run_job(&job);
                        let _ = job.reply.send(reply);
                    }
                })
                .map_err(|e| GraphError::internal(format!("failed to spawn research worker: {e}")))?;
            workers.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers,
            in_flight: Arc::new(AtomicUsize::new(0)),
            limit,
        })
    }

    /// Maximum concurrent research tasks.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Tasks currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Reserves a concurrency slot.
    ///
    /// # Errors
    ///
    /// `ConcurrencyLimit` when every slot is taken.
    pub fn reserve(&self) -> Result<ResearchPermit, RailViolation> {
        let limit = self.limit;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map_err(|_| RailViolation::ConcurrencyLimit { limit })?;
        Ok(ResearchPermit {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Starts a research task holding `permit` until it finishes.
    ///
    /// # Errors
    ///
    /// `Internal` if the pool is shut down.
    pub fn spawn(
        &self,
        permit: ResearchPermit,
        request: ResearchRequest,
        researcher: Arc<dyn Researcher>,
        pipeline: Arc<CommitPipeline>,
        mode: ConsistencyMode,
    ) -> GraphResult<ResearchHandle> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| GraphError::internal("research runtime is shut down"))?;
        let (reply, rx) = bounded::<Reply>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let gap = request.gap;
        let job = Job {
            request,
            researcher,
            pipeline,
            mode,
            cancel: Arc::clone(&cancel),
            reply,
            _permit: permit,
        };
        match tx.try_send(job) {
            Ok(()) => Ok(ResearchHandle { gap, rx, cancel }),
            Err(TrySendError::Full(_)) => Err(RailViolation::ConcurrencyLimit { limit: self.limit }.into()),
            Err(TrySendError::Disconnected(_)) => Err(GraphError::internal("research workers exited")),
        }
    }
}

impl Drop for ResearchRuntime {
    fn drop(&mut self) {
        // Closing the channel lets workers drain queued jobs and exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
