//! Job scheduler
//!
//! Jobs are run-to-completion callables with a priority, optional
//! dependency edges and an optional worker-affinity hint. Dependency
//! discharge is an atomic pending counter: each completed prerequisite
//! decrements it and the job becomes Ready exactly when it hits zero.
//!
//! A panicking payload is caught on the worker; the message is captured on
//! the handle and surfaced from [`JobScheduler::wait`] as
//! [`CoreError::JobFailed`]. Workers never die to a payload panic.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::context::CoreContext;
use crate::error::{CoreError, Result};
use crate::worker::{self, PoolShared};

/// Job admission priority, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl JobPriority {
    pub(crate) const COUNT: usize = 5;

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    /// Waiting on prerequisites
    Pending = 0,
    /// Queued for execution
    Ready = 1,
    /// Claimed by exactly one worker
    Running = 2,
    Done = 3,
    Cancelled = 4,
}

fn state_from_u8(value: u8) -> JobState {
    match value {
        0 => JobState::Pending,
        1 => JobState::Ready,
        2 => JobState::Running,
        3 => JobState::Done,
        _ => JobState::Cancelled,
    }
}

/// Execution context handed to a job payload
///
/// Long-running payloads are expected to poll
/// [`is_cancelled`](JobContext::is_cancelled); cancellation is cooperative.
pub struct JobContext<'a> {
    pub(crate) cancelled: &'a AtomicBool,
    pub(crate) worker: Option<usize>,
}

impl JobContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Index of the worker running this job, `None` when inlined on a
    /// non-worker thread
    pub fn worker_index(&self) -> Option<usize> {
        self.worker
    }
}

pub(crate) type JobPayload = Box<dyn FnOnce(&JobContext<'_>) + Send + 'static>;

pub(crate) type JobRef = Arc<JobInner>;

pub(crate) struct JobInner {
    state: AtomicU8,
    pub(crate) pending_deps: AtomicU32,
    pub(crate) cancelled: AtomicBool,
    pub(crate) priority: JobPriority,
    pub(crate) affinity: Option<usize>,
    pub(crate) payload: Mutex<Option<JobPayload>>,
    /// Jobs whose pending counter this one decrements on completion.
    /// Registration and the terminal state transition both happen under
    /// this lock, so a late registration can never be missed.
    pub(crate) dependents: Mutex<SmallVec<[JobRef; 4]>>,
    pub(crate) failure: Mutex<Option<String>>,
    pub(crate) done_lock: Mutex<bool>,
    pub(crate) done_cv: Condvar,
}

impl JobInner {
    fn new(payload: JobPayload, priority: JobPriority, affinity: Option<usize>) -> JobRef {
        Arc::new(JobInner {
            state: AtomicU8::new(JobState::Pending as u8),
            pending_deps: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            priority,
            affinity,
            payload: Mutex::new(Some(payload)),
            dependents: Mutex::new(SmallVec::new()),
            failure: Mutex::new(None),
            done_lock: Mutex::new(false),
            done_cv: Condvar::new(),
        })
    }

    pub(crate) fn state(&self) -> JobState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state(), JobState::Done | JobState::Cancelled)
    }

    /// Terminal outcome, `None` while the job is still in flight
    pub(crate) fn outcome(&self) -> Option<Result<()>> {
        match self.state() {
            JobState::Done => Some(match self.failure.lock().clone() {
                Some(message) => Err(CoreError::JobFailed(message)),
                None => Ok(()),
            }),
            JobState::Cancelled => Some(Err(CoreError::Cancelled)),
            _ => None,
        }
    }
}

/// A unit of work to submit
pub struct Job {
    payload: JobPayload,
    priority: JobPriority,
    affinity: Option<usize>,
}

impl Job {
    pub fn new(f: impl FnOnce(&JobContext<'_>) + Send + 'static) -> Self {
        Self {
            payload: Box::new(f),
            priority: JobPriority::Normal,
            affinity: None,
        }
    }

    pub(crate) fn from_boxed(payload: JobPayload) -> Self {
        Self {
            payload,
            priority: JobPriority::Normal,
            affinity: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Hint the initial worker; stealing remains free to relocate the job
    pub fn with_affinity(mut self, worker: usize) -> Self {
        self.affinity = Some(worker);
        self
    }
}

/// Shareable handle to a submitted job
#[derive(Clone)]
pub struct JobHandle {
    pub(crate) inner: JobRef,
}

impl JobHandle {
    pub fn state(&self) -> JobState {
        self.inner.state()
    }

    /// True once the job reached Done or Cancelled
    pub fn is_finished(&self) -> bool {
        self.inner.is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("state", &self.state()).finish()
    }
}

/// Work-stealing job scheduler
///
/// Owns the worker threads; dropping it drains queued work and joins them.
pub struct JobScheduler {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl JobScheduler {
    pub fn new(ctx: &Arc<CoreContext>) -> Self {
        let config = ctx.config();
        let shared = PoolShared::new(
            config.worker_count,
            config.deque_capacity,
            config.global_spill_capacity,
            ctx.profiler().clone(),
        );
        let workers = (0..config.worker_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("chunk-ecs-worker-{index}"))
                    .spawn(move || worker::worker_main(shared, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { shared, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    /// Number of workers currently parked waiting for work
    pub fn idle_workers(&self) -> usize {
        self.shared.idle_workers()
    }

    /// Submit a job with no prerequisites
    pub fn submit(&self, job: Job) -> JobHandle {
        let inner = JobInner::new(job.payload, job.priority, job.affinity);
        worker::enqueue(&self.shared, Arc::clone(&inner));
        JobHandle { inner }
    }

    /// Submit a job that becomes Ready once every prerequisite is finished
    ///
    /// Already-finished prerequisites (including cancelled ones) count as
    /// satisfied; cancellation does not cascade.
    pub fn submit_with_deps(&self, job: Job, prereqs: &[JobHandle]) -> JobHandle {
        let inner = JobInner::new(job.payload, job.priority, job.affinity);

        // Guard count keeps the job Pending until registration finishes,
        // even if prerequisites complete concurrently.
        inner.pending_deps.store(1, Ordering::Relaxed);
        for prereq in prereqs {
            let mut dependents = prereq.inner.dependents.lock();
            if !prereq.inner.is_terminal() {
                inner.pending_deps.fetch_add(1, Ordering::Relaxed);
                dependents.push(Arc::clone(&inner));
            }
        }
        if inner.pending_deps.fetch_sub(1, Ordering::AcqRel) == 1 {
            worker::enqueue(&self.shared, Arc::clone(&inner));
        }
        JobHandle { inner }
    }

    /// Block until the job finishes. Called from a worker thread this runs
    /// other jobs instead of blocking.
    pub fn wait(&self, handle: &JobHandle) -> Result<()> {
        self.wait_deadline(handle, None)
    }

    /// As [`wait`](JobScheduler::wait) with a wall-clock deadline
    pub fn wait_deadline(&self, handle: &JobHandle, deadline: Option<Instant>) -> Result<()> {
        if let Some(outcome) = handle.inner.outcome() {
            return outcome;
        }

        if worker::current_worker(&self.shared).is_some() {
            return self.wait_helping(handle, deadline);
        }

        loop {
            if let Some(outcome) = handle.inner.outcome() {
                return outcome;
            }
            let mut done = handle.inner.done_lock.lock();
            if !*done {
                match deadline {
                    None => handle.inner.done_cv.wait(&mut done),
                    Some(deadline) => {
                        if handle
                            .inner
                            .done_cv
                            .wait_until(&mut done, deadline)
                            .timed_out()
                            && !*done
                        {
                            return Err(CoreError::Deadline);
                        }
                    }
                }
            }
        }
    }

    /// Worker-thread wait: keep the pool busy instead of sleeping
    fn wait_helping(&self, handle: &JobHandle, deadline: Option<Instant>) -> Result<()> {
        let index = worker::current_worker(&self.shared).unwrap();
        let mut rng = worker::victim_rng();
        loop {
            if let Some(outcome) = handle.inner.outcome() {
                return outcome;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(CoreError::Deadline);
                }
            }
            match worker::find_work(&self.shared, index, &mut rng) {
                Some(job) => worker::run_job(&self.shared, job, Some(index)),
                None => std::thread::yield_now(),
            }
        }
    }

    /// Request cooperative cancellation
    ///
    /// A still-queued job finishes as Cancelled without running; a running
    /// payload observes the flag through its [`JobContext`]. Dependents are
    /// released either way.
    pub fn cancel(&self, handle: &JobHandle) {
        handle.inner.cancelled.store(true, Ordering::Release);
    }

}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shared.begin_shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("workers", &self.worker_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use std::sync::atomic::AtomicUsize;

    fn scheduler(workers: usize) -> JobScheduler {
        let ctx = CoreContext::new(CoreConfig::default().with_worker_count(workers));
        JobScheduler::new(&ctx)
    }

    #[test]
    fn test_submit_and_wait() {
        let jobs = scheduler(2);
        let flag = Arc::new(AtomicBool::new(false));
        let handle = {
            let flag = Arc::clone(&flag);
            jobs.submit(Job::new(move |_| flag.store(true, Ordering::SeqCst)))
        };
        jobs.wait(&handle).unwrap();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(handle.state(), JobState::Done);
    }

    #[test]
    fn test_dependency_order() {
        let jobs = scheduler(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let log = Arc::clone(&log);
            jobs.submit(Job::new(move |_| log.lock().push(1)))
        };
        let second = {
            let log = Arc::clone(&log);
            jobs.submit_with_deps(Job::new(move |_| log.lock().push(2)), &[first.clone()])
        };
        let third = {
            let log = Arc::clone(&log);
            jobs.submit_with_deps(Job::new(move |_| log.lock().push(3)), &[second.clone()])
        };

        jobs.wait(&third).unwrap();
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_diamond_dependency() {
        let jobs = scheduler(4);
        let count = Arc::new(AtomicUsize::new(0));

        let root = jobs.submit(Job::new(|_| {}));
        let mid: Vec<JobHandle> = (0..4)
            .map(|_| {
                let count = Arc::clone(&count);
                jobs.submit_with_deps(
                    Job::new(move |_| {
                        count.fetch_add(1, Ordering::SeqCst);
                    }),
                    &[root.clone()],
                )
            })
            .collect();
        let join = {
            let count = Arc::clone(&count);
            jobs.submit_with_deps(
                Job::new(move |_| {
                    // All four fan-out jobs are done before the join runs
                    assert_eq!(count.load(Ordering::SeqCst), 4);
                }),
                &mid,
            )
        };

        jobs.wait(&join).unwrap();
    }

    #[test]
    fn test_deps_on_finished_prereq() {
        let jobs = scheduler(1);
        let first = jobs.submit(Job::new(|_| {}));
        jobs.wait(&first).unwrap();

        // Prerequisite already Done: the job must still become Ready
        let second = jobs.submit_with_deps(Job::new(|_| {}), &[first]);
        jobs.wait(&second).unwrap();
    }

    #[test]
    fn test_panic_captured() {
        let jobs = scheduler(2);
        let bad = jobs.submit(Job::new(|_| panic!("boom")));
        assert_eq!(
            jobs.wait(&bad),
            Err(CoreError::JobFailed("boom".to_string()))
        );

        // The worker survived; later jobs run normally
        let good = jobs.submit(Job::new(|_| {}));
        jobs.wait(&good).unwrap();
    }

    #[test]
    fn test_cancel_queued_job() {
        let jobs = scheduler(1);

        // Park the single worker behind a gate job so the target stays
        // queued long enough to cancel.
        let gate = Arc::new(AtomicBool::new(false));
        let gate_job = {
            let gate = Arc::clone(&gate);
            jobs.submit(Job::new(move |_| {
                while !gate.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }))
        };

        let ran = Arc::new(AtomicBool::new(false));
        let victim = {
            let ran = Arc::clone(&ran);
            jobs.submit_with_deps(
                Job::new(move |_| ran.store(true, Ordering::SeqCst)),
                &[gate_job.clone()],
            )
        };

        jobs.cancel(&victim);
        gate.store(true, Ordering::Release);

        assert_eq!(jobs.wait(&victim), Err(CoreError::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancelled_prereq_releases_dependents() {
        let jobs = scheduler(1);

        let gate = Arc::new(AtomicBool::new(false));
        let gate_job = {
            let gate = Arc::clone(&gate);
            jobs.submit(Job::new(move |_| {
                while !gate.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }))
        };

        let doomed = jobs.submit_with_deps(Job::new(|_| {}), &[gate_job.clone()]);
        let dependent = jobs.submit_with_deps(Job::new(|_| {}), &[doomed.clone()]);

        jobs.cancel(&doomed);
        gate.store(true, Ordering::Release);

        assert_eq!(jobs.wait(&doomed), Err(CoreError::Cancelled));
        // Cancellation does not cascade: the dependent still runs
        jobs.wait(&dependent).unwrap();
    }

    #[test]
    fn test_priority_admission() {
        let jobs = scheduler(2);
        let handle = jobs.submit(
            Job::new(|_| {})
                .with_priority(JobPriority::Critical)
                .with_affinity(0),
        );
        jobs.wait(&handle).unwrap();
    }
}
