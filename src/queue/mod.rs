//! Priority job queue with a bounded worker pool.
//!
//! Jobs are admitted without waiting for completion. A fixed number of workers
//! pull the highest-priority ready job (FIFO within a priority) and run it to
//! completion before taking another. Failures are retried with exponential
//! backoff up to the attempt ceiling, then recorded as terminal failures.

mod job;
mod retry;

pub use job::{Job, JobId, JobSnapshot, JobState, Priority, QueueCounts};
pub use retry::{BackoffStrategy, IsRetryable, RetryConfig};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Completed job records retained for inspection.
    pub keep_completed: usize,
    /// Failed job records retained for inspection.
    pub keep_failed: usize,
    /// Running time after which a job is reported as stalled.
    pub stall_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry: RetryConfig::default(),
            keep_completed: 100,
            keep_failed: 50,
            stall_timeout: Duration::from_secs(30),
        }
    }
}

/// The routine executed for every job, plus completion callbacks.
#[async_trait]
pub trait JobProcessor<T: Send + Sync + 'static>: Send + Sync + 'static {
    type Error: fmt::Display + IsRetryable + Send;

    async fn process(&self, job: &Job<T>, progress: &Progress) -> Result<(), Self::Error>;

    /// Called once after a successful attempt.
    async fn on_completed(&self, _job: &Job<T>) {}

    /// Called once when a job reaches the terminal failed state.
    async fn on_failed(&self, _job: &Job<T>, _error: &str) {}
}

/// Advisory progress handle passed to the processor.
pub struct Progress {
    job_id: JobId,
    value: Arc<AtomicU8>,
}

impl Progress {
    /// A handle not attached to any queue, for driving a processor directly.
    pub fn detached(job_id: JobId) -> Self {
        Self {
            job_id,
            value: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Record progress in percent, clamped to 0-100.
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        self.value.store(percent, AtomicOrdering::Relaxed);
        debug!(job_id = %self.job_id, progress = percent, "job progress");
    }

    pub fn get(&self) -> u8 {
        self.value.load(AtomicOrdering::Relaxed)
    }
}

struct Ready<T> {
    seq: u64,
    job: Job<T>,
}

impl<T> PartialEq for Ready<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Ready<T> {}

impl<T> PartialOrd for Ready<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ready<T> {
    // Max-heap: higher priority first, then lower admission sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    ready: BinaryHeap<Ready<T>>,
    live: HashMap<JobId, JobSnapshot>,
    progress: HashMap<JobId, Arc<AtomicU8>>,
    completed: VecDeque<JobSnapshot>,
    failed: VecDeque<JobSnapshot>,
    completed_total: usize,
    failed_total: usize,
    next_id: u64,
    next_seq: u64,
    /// Jobs sleeping through a backoff delay.
    delayed: usize,
    accepting: bool,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            live: HashMap::new(),
            progress: HashMap::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            completed_total: 0,
            failed_total: 0,
            next_id: 1,
            next_seq: 0,
            delayed: 0,
            accepting: true,
        }
    }

    fn push_ready(&mut self, job: Job<T>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(Ready { seq, job });
    }

    fn retire(&mut self, id: JobId, state: JobState, error: Option<String>, config: &QueueConfig) {
        let Some(mut snapshot) = self.live.remove(&id) else {
            return;
        };
        if let Some(progress) = self.progress.remove(&id) {
            snapshot.progress = progress.load(AtomicOrdering::Relaxed);
        }
        snapshot.state = state;
        snapshot.error = error;
        snapshot.finished_at = Some(Utc::now());

        let (ring, keep) = match state {
            JobState::Failed => {
                self.failed_total += 1;
                (&mut self.failed, config.keep_failed)
            }
            _ => {
                snapshot.progress = 100;
                self.completed_total += 1;
                (&mut self.completed, config.keep_completed)
            }
        };
        ring.push_back(snapshot);
        while ring.len() > keep {
            ring.pop_front();
        }
    }
}

enum Next<T> {
    Run(Job<T>, Arc<AtomicU8>),
    Wait,
    Exit,
}

struct Inner<T, P> {
    config: QueueConfig,
    processor: Arc<P>,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, P> Inner<T, P>
where
    T: Send + Sync + 'static,
    P: JobProcessor<T>,
{
    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_job(&self) -> Next<T> {
        let mut state = self.state();
        if let Some(Ready { mut job, .. }) = state.ready.pop() {
            job.attempts += 1;
            let progress = Arc::new(AtomicU8::new(0));
            state.progress.insert(job.id, progress.clone());
            if let Some(snapshot) = state.live.get_mut(&job.id) {
                snapshot.state = JobState::Active;
                snapshot.attempts = job.attempts;
            }
            return Next::Run(job, progress);
        }
        if !state.accepting && state.delayed == 0 {
            Next::Exit
        } else {
            Next::Wait
        }
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        debug!(worker, "queue worker started");
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next_job() {
                Next::Run(job, progress) => self.execute(job, progress).await,
                Next::Wait => notified.await,
                Next::Exit => {
                    // Let idle siblings observe the drained state too.
                    self.notify.notify_waiters();
                    break;
                }
            }
        }
        debug!(worker, "queue worker stopped");
    }

    async fn execute(self: &Arc<Self>, job: Job<T>, progress: Arc<AtomicU8>) {
        let handle = Progress {
            job_id: job.id,
            value: progress,
        };
        let started = Instant::now();
        let stall = self.config.stall_timeout;

        let outcome = {
            let run = AssertUnwindSafe(self.processor.process(&job, &handle)).catch_unwind();
            tokio::pin!(run);
            let mut watchdog = tokio::time::interval_at(started + stall, stall);
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    _ = watchdog.tick() => {
                        warn!(
                            job_id = %job.id,
                            attempt = job.attempts,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "job stalled"
                        );
                    }
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (message, retryable) = match outcome {
            Ok(Ok(())) => {
                self.state()
                    .retire(job.id, JobState::Completed, None, &self.config);
                info!(job_id = %job.id, attempts = job.attempts, elapsed_ms, "job completed");
                self.processor.on_completed(&job).await;
                return;
            }
            Ok(Err(e)) => (e.to_string(), e.is_retryable()),
            Err(_) => ("job processor panicked".to_string(), false),
        };

        let retry = &self.config.retry;
        if retryable && retry.should_retry(job.attempts) {
            let delay = retry.delay_after(job.attempts);
            {
                let mut state = self.state();
                state.delayed += 1;
                if let Some(progress) = state.progress.remove(&job.id) {
                    debug!(job_id = %job.id, progress = progress.load(AtomicOrdering::Relaxed), "progress reset for retry");
                }
                if let Some(snapshot) = state.live.get_mut(&job.id) {
                    snapshot.state = JobState::Retrying;
                    snapshot.error = Some(message.clone());
                }
            }
            warn!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = retry.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "job failed, retrying"
            );

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                {
                    let mut state = inner.state();
                    state.delayed -= 1;
                    state.push_ready(job);
                }
                inner.notify.notify_one();
            });
            return;
        }

        self.state()
            .retire(job.id, JobState::Failed, Some(message.clone()), &self.config);
        error!(
            job_id = %job.id,
            attempts = job.attempts,
            retryable,
            error = %message,
            "job failed permanently"
        );
        self.processor.on_failed(&job, &message).await;
    }
}

/// Cloneable handle to a job queue and its worker pool.
pub struct JobQueue<T, P> {
    inner: Arc<Inner<T, P>>,
}

impl<T, P> Clone for JobQueue<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, P> JobQueue<T, P>
where
    T: Send + Sync + 'static,
    P: JobProcessor<T>,
{
    /// Build an idle queue. Jobs can be admitted before `start`.
    pub fn new(config: QueueConfig, processor: Arc<P>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                processor,
                state: Mutex::new(QueueState::new()),
                notify: Notify::new(),
                started: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the worker pool. Calling it again has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let concurrency = self.inner.config.concurrency.max(1);
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for worker in 0..concurrency {
            workers.push(tokio::spawn(Arc::clone(&self.inner).run_worker(worker)));
        }
        info!(concurrency, "job queue started");
    }

    /// Admit a job. Never waits for it to run.
    pub fn enqueue(&self, payload: T, priority: Priority) -> Result<JobId, QueueError> {
        let id = {
            let mut state = self.inner.state();
            if !state.accepting {
                return Err(QueueError::ShuttingDown);
            }
            let id = JobId(state.next_id);
            state.next_id += 1;

            let enqueued_at = Utc::now();
            state
                .live
                .insert(id, JobSnapshot::queued(id, priority, enqueued_at));
            state.push_ready(Job {
                id,
                payload,
                priority,
                attempts: 0,
                enqueued_at,
            });
            id
        };
        self.inner.notify.notify_one();
        debug!(job_id = %id, ?priority, "job enqueued");
        Ok(id)
    }

    /// Snapshot of a live or recently retired job.
    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        let state = self.inner.state();
        if let Some(snapshot) = state.live.get(&id) {
            let mut snapshot = snapshot.clone();
            if let Some(progress) = state.progress.get(&id) {
                snapshot.progress = progress.load(AtomicOrdering::Relaxed);
            }
            return Some(snapshot);
        }
        state
            .completed
            .iter()
            .chain(state.failed.iter())
            .find(|snapshot| snapshot.id == id)
            .cloned()
    }

    pub fn counts(&self) -> QueueCounts {
        let state = self.inner.state();
        let (mut active, mut retrying) = (0, 0);
        for snapshot in state.live.values() {
            match snapshot.state {
                JobState::Active => active += 1,
                JobState::Retrying => retrying += 1,
                _ => {}
            }
        }
        QueueCounts {
            queued: state.ready.len(),
            active,
            retrying,
            completed: state.completed_total,
            failed: state.failed_total,
        }
    }

    /// Retained failed job records, oldest first.
    pub fn recent_failures(&self) -> Vec<JobSnapshot> {
        self.inner.state().failed.iter().cloned().collect()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.state().accepting
    }

    /// Stop admission and wait for queued, running and retrying jobs to finish.
    ///
    /// Returns `false` when the drain did not complete within `timeout`; the
    /// remaining workers are aborted in that case.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.state().accepting = false;
        self.inner.notify.notify_waiters();
        // Workers may never have been started; start them so the backlog drains.
        self.start();

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        info!(workers = handles.len(), "draining job queue");
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!(counts = ?self.counts(), "job queue drained");
                true
            }
            Err(_) => {
                warn!(counts = ?self.counts(), "job queue drain timed out, aborting workers");
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}
