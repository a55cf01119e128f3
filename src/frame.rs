//! Frame scheduler
//!
//! Lowers the wave plan onto the job scheduler: each wave becomes one job
//! per system plus a fence job depending on all of them; the next wave is
//! not submitted until the fence completes, which is also the happens-
//! before edge between waves. A frame deadline cancels the in-flight wave
//! cooperatively and skips the rest; skipped systems are reported in the
//! outcome and simply run again next frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::context::CoreContext;
use crate::error::{CoreError, Result};
use crate::job::{Job, JobContext, JobHandle, JobPayload, JobScheduler};
use crate::registry::Registry;
use crate::schedule::{build_plan, FramePlan};
use crate::system::{RegisteredSystem, SystemAccess, SystemFn, SystemId};

/// Context handed to a running system
pub struct SystemContext<'a> {
    job: &'a JobContext<'a>,
    name: &'a str,
}

impl SystemContext<'_> {
    /// True once the frame asked this system's wave to stop early
    pub fn is_cancelled(&self) -> bool {
        self.job.is_cancelled()
    }

    pub fn worker_index(&self) -> Option<usize> {
        self.job.worker_index()
    }

    pub fn system_name(&self) -> &str {
        self.name
    }
}

/// Result of one frame
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Systems that ran to completion successfully
    pub ran: Vec<SystemId>,
    /// Systems that returned an error or panicked
    pub failed: Vec<(SystemId, CoreError)>,
    /// Systems not run this frame (deadline or cancelled wave)
    pub skipped: Vec<SystemId>,
    pub wave_count: usize,
    pub elapsed: Duration,
    pub deadline_hit: bool,
}

impl FrameOutcome {
    pub fn all_ran(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Derives a safe parallel plan from system access declarations and
/// dispatches it onto the job scheduler
pub struct FrameScheduler {
    ctx: Arc<CoreContext>,
    jobs: Arc<JobScheduler>,
    systems: Vec<RegisteredSystem>,
    user_edges: Vec<(usize, usize)>,
    plan: FramePlan,
    frame_index: u64,
}

impl FrameScheduler {
    pub fn new(ctx: Arc<CoreContext>, jobs: Arc<JobScheduler>) -> Self {
        Self {
            ctx,
            jobs,
            systems: Vec::new(),
            user_edges: Vec::new(),
            plan: FramePlan::default(),
            frame_index: 0,
        }
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    pub fn system_name(&self, id: SystemId) -> Option<&str> {
        self.systems.get(id.index()).map(|s| s.name.as_str())
    }

    pub fn system_id(&self, name: &str) -> Option<SystemId> {
        self.systems
            .iter()
            .position(|s| s.name == name)
            .map(|i| SystemId(i as u32))
    }

    /// Register a system
    ///
    /// The plan is rebuilt immediately; a cycle introduced by the new
    /// system's conflicts fails here and leaves the schedule unchanged.
    pub fn register(
        &mut self,
        name: &str,
        access: SystemAccess,
        run: impl Fn(&Registry, &SystemContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Result<SystemId> {
        let run: SystemFn = Box::new(run);
        self.systems.push(RegisteredSystem {
            name: name.to_string(),
            access,
            run,
        });
        match self.rebuild_plan() {
            Ok(()) => Ok(SystemId(self.systems.len() as u32 - 1)),
            Err(err) => {
                self.systems.pop();
                self.rebuild_plan().expect("previous plan was valid");
                Err(err)
            }
        }
    }

    /// Constrain `first` to run in an earlier wave than `second`
    pub fn add_order(&mut self, first: SystemId, second: SystemId) -> Result<()> {
        if first.index() >= self.systems.len() || second.index() >= self.systems.len() {
            return Err(CoreError::ScheduleCycle);
        }
        self.user_edges.push((first.index(), second.index()));
        match self.rebuild_plan() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.user_edges.pop();
                self.rebuild_plan().expect("previous plan was valid");
                Err(err)
            }
        }
    }

    /// Number of waves in the current plan
    pub fn wave_count(&self) -> usize {
        self.plan.waves.len()
    }

    /// Systems of each planned wave, for inspection
    pub fn wave_systems(&self) -> Vec<Vec<SystemId>> {
        self.plan
            .waves
            .iter()
            .map(|w| w.systems.iter().map(|&i| SystemId(i as u32)).collect())
            .collect()
    }

    fn rebuild_plan(&mut self) -> Result<()> {
        self.plan = build_plan(&self.systems, &self.user_edges)?;
        Ok(())
    }

    /// Run one frame against the registry
    ///
    /// Systems receive `&Registry`; structural mutation is forbidden inside
    /// a wave, and in-wave component writes are made safe by the conflict
    /// rule the plan was built from.
    pub fn run_frame(&mut self, registry: &Registry) -> FrameOutcome {
        let start = Instant::now();
        let deadline = self.ctx.config().frame_deadline.map(|limit| start + limit);
        self.frame_index += 1;

        #[cfg(feature = "profiling")]
        let _span = info_span!(
            "frame.run",
            frame = self.frame_index,
            waves = self.plan.waves.len()
        )
        .entered();

        let count = self.systems.len();
        let results: Vec<Mutex<Option<Result<()>>>> =
            (0..count).map(|_| Mutex::new(None)).collect();
        let mut handles: Vec<Option<JobHandle>> = (0..count).map(|_| None).collect();
        let mut deadline_hit = false;

        for wave in &self.plan.waves {
            if deadline_hit {
                break;
            }
            self.ctx.profiler().on_wave(wave.len());

            let mut wave_handles = Vec::with_capacity(wave.len());
            for &index in &wave.systems {
                let system = &self.systems[index];
                let result_slot = &results[index];
                let profiler = self.ctx.profiler().clone();

                let payload: Box<dyn FnOnce(&JobContext<'_>) + Send + '_> =
                    Box::new(move |job_ctx| {
                        let started = Instant::now();
                        let system_ctx = SystemContext {
                            job: job_ctx,
                            name: &system.name,
                        };
                        let result = (system.run)(registry, &system_ctx);
                        profiler.on_system_run(index as u32, started, Instant::now());
                        *result_slot.lock() = Some(result);
                    });
                let handle = unsafe { self.submit_scoped(payload) };
                handles[index] = Some(handle.clone());
                wave_handles.push(handle);
            }

            let fence = self.jobs.submit_with_deps(Job::new(|_| {}), &wave_handles);
            match self.jobs.wait_deadline(&fence, deadline) {
                Err(CoreError::Deadline) => {
                    deadline_hit = true;
                    for handle in &wave_handles {
                        self.jobs.cancel(handle);
                    }
                    // Every wave job must reach a terminal state before the
                    // frame borrow ends; cancelled queued jobs finish
                    // without running.
                    let _ = self.jobs.wait(&fence);
                }
                _ => {}
            }
        }

        let mut outcome = FrameOutcome {
            wave_count: self.plan.waves.len(),
            deadline_hit,
            ..FrameOutcome::default()
        };
        for index in 0..count {
            let id = SystemId(index as u32);
            match results[index].lock().take() {
                Some(Ok(())) => outcome.ran.push(id),
                Some(Err(err)) => outcome.failed.push((id, err)),
                None => match handles[index].as_ref().and_then(|h| h.inner.outcome()) {
                    Some(Err(CoreError::JobFailed(message))) => {
                        outcome.failed.push((id, CoreError::JobFailed(message)));
                    }
                    _ => outcome.skipped.push(id),
                },
            }
        }
        outcome.elapsed = start.elapsed();
        outcome
    }

    /// Submit a frame-scoped payload.
    ///
    /// # Safety
    /// The payload borrows frame-local state (`registry`, the systems, the
    /// result slots). It is laundered to `'static` for submission; this is
    /// sound because `run_frame` waits for each wave's fence before its
    /// borrows end, and a job is only reachable from its wave's fence, so
    /// no payload can run or be dropped after `run_frame` returns.
    unsafe fn submit_scoped(&self, payload: Box<dyn FnOnce(&JobContext<'_>) + Send + '_>) -> JobHandle {
        let payload: JobPayload = unsafe {
            std::mem::transmute::<
                Box<dyn FnOnce(&JobContext<'_>) + Send + '_>,
                Box<dyn FnOnce(&JobContext<'_>) + Send + 'static>,
            >(payload)
        };
        self.jobs.submit(Job::from_boxed(payload))
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("systems", &self.systems.len())
            .field("waves", &self.plan.waves.len())
            .finish()
    }
}
