//! Demo: entity lifecycle and query iteration

use chunk_ecs::{CoreConfig, Registry};

#[derive(Debug)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug)]
struct Velocity {
    x: f32,
    y: f32,
}

#[derive(Debug)]
struct Health(u32);

fn main() {
    let mut registry = Registry::new(CoreConfig::default());

    println!("Creating entities...");

    let entity1 = registry
        .create_entity((Position { x: 0.0, y: 0.0 }, Velocity { x: 1.0, y: 0.5 }))
        .expect("create entity1");
    println!("Created entity {entity1:?}");

    let entity2 = registry
        .create_entity((
            Position { x: 10.0, y: 20.0 },
            Velocity { x: -1.0, y: 2.0 },
            Health(100),
        ))
        .expect("create entity2");
    println!("Created entity {entity2:?}");

    let entity3 = registry
        .create_entity((Position { x: 5.0, y: 5.0 },))
        .expect("create entity3");
    println!("Created entity {entity3:?}");

    // Move everything one step
    let moving = registry
        .query()
        .with::<Position>()
        .with::<Velocity>()
        .resolve();
    moving.for_each_chunk_mut(&mut registry, |mut view| {
        let velocities: Vec<(f32, f32)> = view
            .column::<Velocity>()
            .unwrap()
            .iter()
            .map(|v| (v.x, v.y))
            .collect();
        let positions = view.column_mut::<Position>().unwrap();
        for (position, (dx, dy)) in positions.iter_mut().zip(velocities) {
            position.x += dx;
            position.y += dy;
        }
    });

    println!("\nAfter one step:");
    let all = registry.query().with::<Position>().resolve();
    all.for_each_row(&registry, |entity, row| {
        let position = row.get::<Position>().unwrap();
        println!("  {entity:?} at ({}, {})", position.x, position.y);
    });

    registry.destroy_entity(entity2).expect("destroy entity2");
    println!("\nDestroyed {entity2:?}");
    println!(
        "Live entities: {} across {} archetypes",
        registry.entity_count(),
        registry.archetype_count()
    );

    // Stale handles are detected, not dereferenced
    match registry.get::<Health>(entity2) {
        Err(err) => println!("Lookup on destroyed handle: {err}"),
        Ok(_) => unreachable!(),
    }
}
