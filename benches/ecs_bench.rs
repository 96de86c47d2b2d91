#![allow(dead_code)]
//! Query and component access benchmarks
//!
//! Run with: cargo bench --bench ecs_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tenant_ecs::World;

#[derive(Debug, Copy, Clone)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Copy, Clone)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Copy, Clone)]
struct Health(u32);

fn populate(world: &World, count: usize) {
    for i in 0..count {
        let position = Position {
            x: i as f32,
            y: 0.0,
            z: 0.0,
        };
        let velocity = Velocity {
            x: 1.0,
            y: 0.0,
            z: 0.0,
        };
        // Spread entities over three compositions.
        match i % 3 {
            0 => world.create_entity((position, velocity)).unwrap(),
            1 => world.create_entity((position, velocity, Health(100))).unwrap(),
            _ => world.create_entity((position,)).unwrap(),
        };
    }
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    for count in [1_000, 10_000, 100_000] {
        let world = World::new().unwrap();
        populate(&world, count);

        group.bench_with_input(BenchmarkId::new("position", count), &world, |b, world| {
            b.iter(|| {
                let mut sum = 0.0f32;
                for m in world.find_entities_with::<(&Position,)>().iter() {
                    sum += m.components.0.x;
                }
                black_box(sum)
            });
        });

        group.bench_with_input(
            BenchmarkId::new("position_velocity", count),
            &world,
            |b, world| {
                b.iter(|| {
                    let mut sum = 0.0f32;
                    for m in world.find_entities_with::<(&Position, &Velocity)>().iter() {
                        sum += m.components.0.x * m.components.1.x;
                    }
                    black_box(sum)
                });
            },
        );
    }

    group.finish();
}

fn bench_component_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("component_access");

    let world = World::new().unwrap();
    let entities: Vec<_> = (0..10_000)
        .map(|i| {
            world
                .create_entity((Position {
                    x: i as f32,
                    y: 0.0,
                    z: 0.0,
                },))
                .unwrap()
        })
        .collect();

    group.bench_function("with_component_10k", |b| {
        b.iter(|| {
            let mut sum = 0.0f32;
            for entity in &entities {
                sum += world
                    .with_component(entity, |p: &Position| p.x)
                    .unwrap_or(0.0);
            }
            black_box(sum)
        });
    });

    group.bench_function("with_component_mut_10k", |b| {
        b.iter(|| {
            for entity in &entities {
                world.with_component_mut(entity, |p: &mut Position| p.y += 1.0);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_query, bench_component_access);
criterion_main!(benches);
