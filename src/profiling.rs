//! Instrumentation hooks
//!
//! Counters published by the worker pool, the job scheduler and the frame
//! scheduler. The handle is a thin `Option`; when profiling is disabled at
//! startup every hook is an inlined no-op. Span-level instrumentation is
//! additionally available behind the `profiling` cargo feature via
//! `tracing`, following the pattern used on the registry's hot paths.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Aggregated timing for one system, in the shape reported by
/// [`ProfilerHandle::system_stats`]
#[derive(Debug, Clone)]
pub struct SystemStats {
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
    pub call_count: u64,
}

impl SystemStats {
    pub fn avg(&self) -> Duration {
        if self.call_count == 0 {
            Duration::ZERO
        } else {
            self.total / self.call_count as u32
        }
    }
}

/// Interval during which one system job was running, relative to the
/// profiler's epoch. Used to verify intra-wave overlap.
#[derive(Debug, Clone, Copy)]
pub struct SystemSpan {
    pub system: u32,
    pub start: Duration,
    pub end: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    jobs_executed: AtomicU64,
    jobs_inlined: AtomicU64,
    steal_attempts: AtomicU64,
    steals: AtomicU64,
    spills: AtomicU64,
    parks: AtomicU64,
    /// Deepest deque occupancy sampled on push/pop
    deque_depth_max: AtomicU64,
    /// Total nanoseconds spent inside job payloads
    job_nanos: AtomicU64,
}

/// Counter store behind [`ProfilerHandle`]
pub struct CoreProfiler {
    epoch: Instant,
    counters: Counters,
    wave_sizes: Mutex<Vec<usize>>,
    system_timings: Mutex<FxHashMap<u32, SystemStats>>,
    system_spans: Mutex<Vec<SystemSpan>>,
}

impl CoreProfiler {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            counters: Counters::default(),
            wave_sizes: Mutex::new(Vec::new()),
            system_timings: Mutex::new(FxHashMap::default()),
            system_spans: Mutex::new(Vec::new()),
        }
    }
}

/// Cheap, cloneable handle to the profiler
///
/// Disabled handles carry `None` and every hook compiles down to a branch
/// on it.
#[derive(Clone)]
pub struct ProfilerHandle(Option<Arc<CoreProfiler>>);

impl ProfilerHandle {
    pub(crate) fn new(enabled: bool) -> Self {
        ProfilerHandle(enabled.then(|| Arc::new(CoreProfiler::new())))
    }

    /// Handle that records nothing
    pub fn disabled() -> Self {
        ProfilerHandle(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    #[inline]
    pub(crate) fn on_job_executed(&self) {
        if let Some(p) = &self.0 {
            p.counters.jobs_executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn on_job_inlined(&self) {
        if let Some(p) = &self.0 {
            p.counters.jobs_inlined.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn on_steal_attempt(&self) {
        if let Some(p) = &self.0 {
            p.counters.steal_attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn on_steal_success(&self) {
        if let Some(p) = &self.0 {
            p.counters.steals.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn on_spill(&self) {
        if let Some(p) = &self.0 {
            p.counters.spills.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn on_park(&self) {
        if let Some(p) = &self.0 {
            p.counters.parks.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn on_deque_depth(&self, depth: usize) {
        if let Some(p) = &self.0 {
            p.counters
                .deque_depth_max
                .fetch_max(depth as u64, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn on_job_run(&self, elapsed: Duration) {
        if let Some(p) = &self.0 {
            p.counters
                .job_nanos
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn on_wave(&self, size: usize) {
        if let Some(p) = &self.0 {
            p.wave_sizes.lock().push(size);
        }
    }

    pub(crate) fn on_system_run(&self, system: u32, start: Instant, end: Instant) {
        let Some(p) = &self.0 else { return };
        let duration = end - start;
        {
            let mut timings = p.system_timings.lock();
            let stats = timings.entry(system).or_insert(SystemStats {
                min: Duration::MAX,
                max: Duration::ZERO,
                total: Duration::ZERO,
                call_count: 0,
            });
            stats.min = stats.min.min(duration);
            stats.max = stats.max.max(duration);
            stats.total += duration;
            stats.call_count += 1;
        }
        p.system_spans.lock().push(SystemSpan {
            system,
            start: start - p.epoch,
            end: end - p.epoch,
        });
    }

    pub fn jobs_executed(&self) -> u64 {
        self.load(|c| &c.jobs_executed)
    }

    pub fn jobs_inlined(&self) -> u64 {
        self.load(|c| &c.jobs_inlined)
    }

    pub fn steal_attempts(&self) -> u64 {
        self.load(|c| &c.steal_attempts)
    }

    pub fn steals(&self) -> u64 {
        self.load(|c| &c.steals)
    }

    pub fn spills(&self) -> u64 {
        self.load(|c| &c.spills)
    }

    pub fn parks(&self) -> u64 {
        self.load(|c| &c.parks)
    }

    pub fn max_deque_depth(&self) -> u64 {
        self.load(|c| &c.deque_depth_max)
    }

    /// Total wall time spent inside job payloads
    pub fn job_time(&self) -> Duration {
        Duration::from_nanos(self.load(|c| &c.job_nanos))
    }

    /// Sizes of every wave dispatched since startup, in dispatch order
    pub fn wave_sizes(&self) -> Vec<usize> {
        self.0
            .as_ref()
            .map(|p| p.wave_sizes.lock().clone())
            .unwrap_or_default()
    }

    pub fn system_stats(&self, system: u32) -> Option<SystemStats> {
        self.0.as_ref()?.system_timings.lock().get(&system).cloned()
    }

    /// Run intervals of every system job since startup
    pub fn system_spans(&self) -> Vec<SystemSpan> {
        self.0
            .as_ref()
            .map(|p| p.system_spans.lock().clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Some(p) = &self.0 {
            p.wave_sizes.lock().clear();
            p.system_timings.lock().clear();
            p.system_spans.lock().clear();
        }
    }

    fn load(&self, field: impl Fn(&Counters) -> &AtomicU64) -> u64 {
        self.0
            .as_ref()
            .map(|p| field(&p.counters).load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for ProfilerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilerHandle")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
