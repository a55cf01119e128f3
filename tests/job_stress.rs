use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chunk_ecs::{CoreConfig, CoreContext, CoreError, Job, JobPriority, JobScheduler};

fn scheduler(workers: usize, profiling: bool) -> (Arc<CoreContext>, JobScheduler) {
    let ctx = CoreContext::new(
        CoreConfig::default()
            .with_worker_count(workers)
            .with_profiling(profiling),
    );
    let jobs = JobScheduler::new(&ctx);
    (ctx, jobs)
}

/// 100 000 no-op jobs from the main thread with four workers: all complete
/// and the pool actually stole work
#[test]
fn flood_of_noop_jobs_completes() {
    const JOBS: usize = 100_000;

    let (ctx, jobs) = scheduler(4, true);
    let executed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..JOBS)
        .map(|_| {
            let executed = Arc::clone(&executed);
            jobs.submit(Job::new(move |_| {
                executed.fetch_add(1, Ordering::Relaxed);
            }))
        })
        .collect();

    for handle in &handles {
        jobs.wait(handle).unwrap();
    }
    assert_eq!(executed.load(Ordering::Relaxed), JOBS);
    assert_eq!(ctx.profiler().jobs_executed(), JOBS as u64);
    assert!(
        ctx.profiler().steal_attempts() > 0,
        "workers running dry must attempt steals"
    );
}

/// A panicking job surfaces JobFailed("boom"); workers stay alive
#[test]
fn panic_is_captured_on_the_handle() {
    let (_ctx, jobs) = scheduler(4, false);

    let bad = jobs.submit(Job::new(|_| panic!("boom")));
    assert_eq!(jobs.wait(&bad), Err(CoreError::JobFailed("boom".to_string())));

    // Subsequent jobs execute normally on every worker
    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..64)
        .map(|_| {
            let counter = Arc::clone(&counter);
            jobs.submit(Job::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
        })
        .collect();
    for handle in &handles {
        jobs.wait(handle).unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 64);
}

/// No job runs before all its prerequisites are done, across a wide
/// dependency fan
#[test]
fn dependency_discharge_is_exact() {
    let (_ctx, jobs) = scheduler(4, false);

    const LAYERS: usize = 8;
    const WIDTH: usize = 32;

    let layer_done = Arc::new((0..LAYERS).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());

    let mut previous: Vec<chunk_ecs::JobHandle> = Vec::new();
    for layer in 0..LAYERS {
        let mut current = Vec::with_capacity(WIDTH);
        for _ in 0..WIDTH {
            let layer_done = Arc::clone(&layer_done);
            let job = Job::new(move |_| {
                if layer > 0 {
                    // Every job of the previous layer must have finished
                    assert_eq!(
                        layer_done[layer - 1].load(Ordering::SeqCst),
                        WIDTH,
                        "layer {layer} started before layer {} drained",
                        layer - 1
                    );
                }
                layer_done[layer].fetch_add(1, Ordering::SeqCst);
            });
            current.push(jobs.submit_with_deps(job, &previous));
        }
        previous = current;
    }

    for handle in &previous {
        jobs.wait(handle).unwrap();
    }
    for layer in layer_done.iter() {
        assert_eq!(layer.load(Ordering::SeqCst), WIDTH);
    }
}

/// Submissions from many non-worker threads at once
#[test]
fn concurrent_submission_from_many_threads() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 2_000;

    let (_ctx, jobs) = scheduler(4, false);
    let jobs = Arc::new(jobs);
    let executed = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            let jobs = Arc::clone(&jobs);
            let executed = Arc::clone(&executed);
            s.spawn(move || {
                let handles: Vec<_> = (0..PER_THREAD)
                    .map(|_| {
                        let executed = Arc::clone(&executed);
                        jobs.submit(Job::new(move |_| {
                            executed.fetch_add(1, Ordering::Relaxed);
                        }))
                    })
                    .collect();
                for handle in &handles {
                    jobs.wait(handle).unwrap();
                }
            });
        }
    });

    assert_eq!(executed.load(Ordering::Relaxed), THREADS * PER_THREAD);
}

/// Jobs submitted from inside jobs land on the submitting worker's own
/// deque and still all complete
#[test]
fn nested_submission_completes() {
    let (_ctx, jobs) = scheduler(2, false);
    let jobs = Arc::new(jobs);
    let executed = Arc::new(AtomicUsize::new(0));

    let root = {
        let jobs_inner = Arc::clone(&jobs);
        let executed = Arc::clone(&executed);
        jobs.submit(Job::new(move |_| {
            let children: Vec<_> = (0..100)
                .map(|_| {
                    let executed = Arc::clone(&executed);
                    jobs_inner.submit(Job::new(move |_| {
                        executed.fetch_add(1, Ordering::Relaxed);
                    }))
                })
                .collect();
            // Worker-thread wait: helps run the children instead of
            // blocking the pool
            for child in &children {
                jobs_inner.wait(child).unwrap();
            }
        }))
    };

    jobs.wait(&root).unwrap();
    assert_eq!(executed.load(Ordering::Relaxed), 100);
}

/// Priorities admit without reordering guarantees; every class drains
#[test]
fn all_priority_classes_drain() {
    let (_ctx, jobs) = scheduler(2, false);
    let executed = Arc::new(AtomicUsize::new(0));

    let priorities = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
        JobPriority::Background,
    ];
    let handles: Vec<_> = (0..500)
        .map(|i| {
            let executed = Arc::clone(&executed);
            jobs.submit(
                Job::new(move |_| {
                    executed.fetch_add(1, Ordering::Relaxed);
                })
                .with_priority(priorities[i % priorities.len()]),
            )
        })
        .collect();

    for handle in &handles {
        jobs.wait(handle).unwrap();
    }
    assert_eq!(executed.load(Ordering::Relaxed), 500);
}
