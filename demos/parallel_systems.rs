//! Demo: systems scheduled into parallel waves from their access
//! declarations, dispatched onto the work-stealing job scheduler

use std::sync::Arc;

use chunk_ecs::{
    CoreConfig, CoreContext, FrameScheduler, JobScheduler, Registry, SystemAccess,
};

#[derive(Debug, Clone, Copy)]
struct Position(f32, f32);
#[derive(Debug, Clone, Copy)]
struct Velocity(f32, f32);
#[derive(Debug, Clone, Copy)]
struct Lifetime(u32);

fn main() {
    let ctx = CoreContext::new(
        CoreConfig::default()
            .with_worker_count(4)
            .with_profiling(true),
    );
    let mut registry = Registry::with_context(Arc::clone(&ctx));
    let jobs = Arc::new(JobScheduler::new(&ctx));
    let mut scheduler = FrameScheduler::new(Arc::clone(&ctx), Arc::clone(&jobs));

    for i in 0..10_000u32 {
        registry
            .create_entity((
                Position(i as f32, 0.0),
                Velocity(0.1, 0.2),
                Lifetime(600 + i % 60),
            ))
            .expect("create entity");
    }
    println!("Created {} entities", registry.entity_count());

    // Writes Position, reads Velocity
    let movement = SystemAccess::builder(&ctx)
        .reads::<Velocity>()
        .writes::<Position>()
        .build()
        .unwrap();
    scheduler
        .register("movement", movement, |registry, _| {
            let query = registry
                .query()
                .with::<Position>()
                .with::<Velocity>()
                .resolve();
            query.for_each_chunk(registry, |view| {
                let velocities = view.column::<Velocity>().unwrap().to_vec();
                let positions = unsafe { view.column_mut::<Position>() }.unwrap();
                for (position, velocity) in positions.iter_mut().zip(velocities) {
                    position.0 += velocity.0;
                    position.1 += velocity.1;
                }
            });
            Ok(())
        })
        .unwrap();

    // Writes Lifetime: disjoint from movement, shares its wave
    let aging = SystemAccess::builder(&ctx).writes::<Lifetime>().build().unwrap();
    scheduler
        .register("aging", aging, |registry, _| {
            let query = registry.query().with::<Lifetime>().resolve();
            query.for_each_chunk(registry, |view| {
                let lifetimes = unsafe { view.column_mut::<Lifetime>() }.unwrap();
                for lifetime in lifetimes {
                    lifetime.0 = lifetime.0.saturating_sub(1);
                }
            });
            Ok(())
        })
        .unwrap();

    // Reads Position: conflicts with movement, lands in the next wave
    let bounds = SystemAccess::builder(&ctx).reads::<Position>().build().unwrap();
    scheduler
        .register("bounds", bounds, |registry, _| {
            let query = registry.query().with::<Position>().resolve();
            let mut extent = 0.0f32;
            query.for_each_chunk(registry, |view| {
                for position in view.column::<Position>().unwrap() {
                    extent = extent.max(position.0.abs().max(position.1.abs()));
                }
            });
            let _ = extent;
            Ok(())
        })
        .unwrap();

    println!("Planned {} waves:", scheduler.wave_count());
    for (index, wave) in scheduler.wave_systems().iter().enumerate() {
        let names: Vec<_> = wave
            .iter()
            .map(|&id| scheduler.system_name(id).unwrap_or("?"))
            .collect();
        println!("  wave {index}: {names:?}");
    }

    for frame in 0..60 {
        let outcome = scheduler.run_frame(&registry);
        if !outcome.all_ran() {
            println!("frame {frame}: {outcome:?}");
        }
    }

    let profiler = ctx.profiler();
    println!("\nAfter 60 frames:");
    println!("  jobs executed:  {}", profiler.jobs_executed());
    println!("  steal attempts: {}", profiler.steal_attempts());
    println!("  steals:         {}", profiler.steals());
    println!("  spills:         {}", profiler.spills());
    println!("  parks:          {}", profiler.parks());
}
