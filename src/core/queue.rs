//! Priority job queue
//!
//! Accepts inference jobs, dispatches them in descending-priority order up to
//! a concurrency cap, and applies the coarse per-job retry policy: a failed
//! job is requeued with a boosted priority until its attempt budget runs out.
//! The fine-grained per-attempt retry lives below, in the executor.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    config::QueueConfig,
    core::{
        error::{DispatchError, DispatchResult},
        job::{Job, JobEvent, JobId, JobSpec, JobState, JobStatus},
    },
};

/// Execution seam between the queue and the resilience stack below it.
///
/// The queue never speaks a wire protocol; it hands `(role, payload)` to the
/// injected executor and observes the outcome.
#[async_trait]
pub trait JobExecutor: Send + Sync + fmt::Debug {
    async fn execute(&self, role: &str, payload: &Value) -> DispatchResult<Value>;
}

/// Heap entry ordered by descending priority, then submission order
#[derive(Debug, Clone, Eq, PartialEq)]
struct PendingEntry {
    priority: i32,
    seq: u64,
    id: JobId,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // max-heap: higher priority first, then lower sequence (earlier
        // submission) first for stability
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Read-only queue counters for the status export
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Priority job queue with tick-driven dispatch
pub struct PriorityJobQueue {
    config: QueueConfig,
    executor: Arc<dyn JobExecutor>,
    jobs: DashMap<JobId, Job>,
    pending: Mutex<BinaryHeap<PendingEntry>>,
    pending_count: AtomicUsize,
    active_count: AtomicUsize,
    completed_count: AtomicU64,
    failed_count: AtomicU64,
    seq: AtomicU64,
    events: broadcast::Sender<JobEvent>,
}

impl fmt::Debug for PriorityJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityJobQueue")
            .field("pending", &self.pending_count.load(Ordering::Relaxed))
            .field("active", &self.active_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl PriorityJobQueue {
    pub fn new(config: QueueConfig, executor: Arc<dyn JobExecutor>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            executor,
            jobs: DashMap::new(),
            pending: Mutex::new(BinaryHeap::new()),
            pending_count: AtomicUsize::new(0),
            active_count: AtomicUsize::new(0),
            completed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            events,
        })
    }

    /// Submit a job. Returns immediately with the job id; the outcome is
    /// observed through `status` or a subscription.
    pub fn submit(&self, spec: JobSpec) -> DispatchResult<JobId> {
        if spec.role.is_empty() {
            return Err(DispatchError::validation("job role is empty"));
        }
        if self.pending_count.load(Ordering::Acquire) >= self.config.capacity {
            return Err(DispatchError::Backpressure {
                capacity: self.config.capacity,
            });
        }

        let id = match spec.id {
            Some(raw) => {
                let id = JobId::from_string(raw);
                if self.jobs.contains_key(&id) {
                    return Err(DispatchError::validation(format!(
                        "duplicate job id: {id}"
                    )));
                }
                id
            }
            None => JobId::new(),
        };

        let job = Job {
            id: id.clone(),
            payload: spec.payload,
            priority: spec.priority,
            submitted_priority: spec.priority,
            role: spec.role,
            created_at: Instant::now(),
            attempts: 0,
            max_attempts: spec
                .max_attempts
                .unwrap_or(self.config.default_max_attempts)
                .max(1),
            state: JobState::Pending,
            last_error: None,
            settled_at: None,
        };

        debug!(job = %id, priority = job.priority, role = %job.role, "Job submitted");
        // record before heap entry: a tick that pops the entry must find the job
        self.jobs.insert(id.clone(), job.clone());
        self.push_pending(&job);
        Ok(id)
    }

    fn push_pending(&self, job: &Job) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .expect("pending heap lock poisoned")
            .push(PendingEntry {
                priority: job.priority,
                seq,
                id: job.id.clone(),
            });
        self.pending_count.fetch_add(1, Ordering::Release);
    }

    /// One scheduler tick: dispatch the highest-priority ready jobs while
    /// concurrency slots are free. Starts executions as independent tasks
    /// and never awaits their completion.
    pub fn dispatch_tick(self: &Arc<Self>) {
        loop {
            if self.active_count.load(Ordering::Acquire) >= self.config.max_concurrent {
                return;
            }

            let entry = {
                let mut heap = self.pending.lock().expect("pending heap lock poisoned");
                let Some(entry) = heap.pop() else { return };
                entry
            };

            // Stale entries remain in the heap after a cancel; skip them.
            // `cancel` already released their pending-count slot.
            let Some(mut job) = self.jobs.get_mut(&entry.id) else {
                continue;
            };
            if job.state != JobState::Pending {
                continue;
            }
            self.pending_count.fetch_sub(1, Ordering::Release);

            job.state = JobState::Active;
            job.attempts += 1;
            let attempts = job.attempts;
            let max_attempts = job.max_attempts;
            let role = job.role.clone();
            let payload = job.payload.clone();
            let id = job.id.clone();
            drop(job);

            self.active_count.fetch_add(1, Ordering::AcqRel);
            let _ = self.events.send(JobEvent::Progress {
                id: id.clone(),
                fraction: attempts as f64 / max_attempts as f64,
            });
            debug!(job = %id, attempt = attempts, "Dispatching job");

            let queue = Arc::clone(self);
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                let outcome = executor.execute(&role, &payload).await;
                queue.on_job_settled(&id, outcome);
            });
        }
    }

    /// Apply the coarse per-job retry policy after one execution attempt
    fn on_job_settled(&self, id: &JobId, outcome: DispatchResult<Value>) {
        self.active_count.fetch_sub(1, Ordering::AcqRel);

        let Some(mut job) = self.jobs.get_mut(id) else {
            warn!(job = %id, "Settled job missing from the live set");
            return;
        };

        match outcome {
            Ok(result) => {
                job.state = JobState::Completed;
                job.settled_at = Some(Instant::now());
                drop(job);
                self.completed_count.fetch_add(1, Ordering::Relaxed);
                debug!(job = %id, "Job completed");
                let _ = self.events.send(JobEvent::Completed {
                    id: id.clone(),
                    result,
                });
            }
            Err(error) => {
                if job.attempts >= job.max_attempts {
                    let terminal = DispatchError::AttemptsExceeded {
                        id: id.to_string(),
                        max_attempts: job.max_attempts,
                        last_error: error.to_string(),
                    };
                    job.state = JobState::Failed;
                    job.last_error = Some(terminal.clone());
                    job.settled_at = Some(Instant::now());
                    drop(job);
                    self.failed_count.fetch_add(1, Ordering::Relaxed);
                    warn!(job = %id, error = %terminal, "Job failed terminally");
                    let _ = self.events.send(JobEvent::Failed {
                        id: id.clone(),
                        error: terminal,
                    });
                } else {
                    // aging: boost priority so retried jobs are not starved
                    job.state = JobState::Pending;
                    job.priority += self.config.retry_priority_boost;
                    job.last_error = Some(error);
                    let snapshot = job.clone();
                    drop(job);
                    debug!(
                        job = %id,
                        attempt = snapshot.attempts,
                        priority = snapshot.priority,
                        "Job requeued after failed attempt"
                    );
                    self.push_pending(&snapshot);
                }
            }
        }
    }

    /// Cancel a pending job. Returns `true` if the job was removed; an
    /// already-active job is unaffected and `false` is returned (there is no
    /// mid-flight cancellation).
    pub fn cancel(&self, id: &JobId) -> bool {
        // remove_if holds the entry lock across the state check, so a
        // concurrent dispatch cannot activate the job mid-cancel. The heap
        // entry stays behind and is skipped as stale at dispatch.
        let removed = self
            .jobs
            .remove_if(id, |_, job| job.state == JobState::Pending)
            .is_some();
        if removed {
            self.pending_count.fetch_sub(1, Ordering::Release);
            debug!(job = %id, "Pending job cancelled");
        }
        removed
    }

    /// Explicit operator retry of a terminally failed job: the one
    /// sanctioned re-entry out of a terminal state.
    pub fn retry_failed(&self, id: &JobId) -> DispatchResult<()> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Err(DispatchError::JobNotFound { id: id.to_string() });
        };
        if job.state != JobState::Failed {
            return Err(DispatchError::validation(format!(
                "job {id} is {}, only failed jobs can be retried",
                job.state
            )));
        }
        job.state = JobState::Pending;
        job.attempts = 0;
        job.priority = job.submitted_priority;
        job.last_error = None;
        job.settled_at = None;
        let snapshot = job.clone();
        drop(job);
        self.push_pending(&snapshot);
        Ok(())
    }

    /// Read-only status query; never mutates queue state
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.jobs.get(id).map(|job| JobStatus::from(&*job))
    }

    /// Read-only queue counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending_count.load(Ordering::Acquire),
            active: self.active_count.load(Ordering::Acquire),
            completed: self.completed_count.load(Ordering::Relaxed),
            failed: self.failed_count.load(Ordering::Relaxed),
        }
    }

    /// Subscribe to job outcome notifications. Dropping the receiver is the
    /// only teardown required.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Drop terminal job records older than the configured TTL. Removals are
    /// counted inside the retain closure; the map length cannot be compared
    /// before and after while concurrent submits insert.
    fn cleanup_settled(&self) {
        let ttl = Duration::from_secs(self.config.completed_ttl_secs);
        let mut removed = 0usize;
        self.jobs.retain(|_, job| {
            let expired = job.state.is_terminal()
                && job.settled_at.is_some_and(|settled| settled.elapsed() >= ttl);
            if expired {
                removed += 1;
            }
            !expired
        });
        if removed > 0 {
            debug!(removed, "Cleaned up settled job records");
        }
    }

    /// Start the dispatch ticker and the settled-record cleanup loop. Both
    /// stop when the handle shuts down or the queue is dropped.
    pub fn start(self: &Arc<Self>) -> QueueTicker {
        let shutdown = Arc::new(AtomicBool::new(false));

        let dispatch_shutdown = shutdown.clone();
        let queue: Weak<PriorityJobQueue> = Arc::downgrade(self);
        let tick_interval = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let dispatch_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;
                if dispatch_shutdown.load(Ordering::Acquire) {
                    debug!("Dispatch ticker shutting down");
                    break;
                }
                let Some(queue) = queue.upgrade() else { break };
                queue.dispatch_tick();
            }
        });

        let cleanup_shutdown = shutdown.clone();
        let queue: Weak<PriorityJobQueue> = Arc::downgrade(self);
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if cleanup_shutdown.load(Ordering::Acquire) {
                    break;
                }
                let Some(queue) = queue.upgrade() else { break };
                queue.cleanup_settled();
            }
        });

        QueueTicker {
            dispatch_handle,
            cleanup_handle,
            shutdown,
        }
    }
}

/// Ticker handle owning the queue's background loops
pub struct QueueTicker {
    dispatch_handle: tokio::task::JoinHandle<()>,
    cleanup_handle: tokio::task::JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl fmt::Debug for QueueTicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueTicker")
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl QueueTicker {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.dispatch_handle.abort();
        self.cleanup_handle.abort();
    }
}
