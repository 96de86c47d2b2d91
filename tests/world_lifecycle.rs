use std::any::TypeId;

use tenant_ecs::prelude::*;
use tenant_ecs::IdSchema;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Velocity {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, PartialEq)]
struct Name(String);

#[derive(Debug, Clone, Copy, PartialEq)]
struct Health(u32);

fn small_world() -> World {
    World::with_config(EngineConfig::default().with_chunk_bit(4)).unwrap()
}

fn pos(x: f32) -> Position {
    Position { x, y: -x }
}

fn vel(x: f32) -> Velocity {
    Velocity { x, y: 0.0 }
}

#[test]
fn test_create_find_destroy() {
    let world = small_world();
    let moving = world.create_entity((pos(1.0), vel(2.0))).unwrap();
    let named = world
        .create_entity((Name("static".into()), pos(3.0)))
        .unwrap();
    let _health_only = world.create_entity((Health(10),)).unwrap();

    let mut xs: Vec<f32> = world
        .find_entities_with::<(&Position,)>()
        .iter()
        .map(|m| m.components.0.x)
        .collect();
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(xs, vec![1.0, 3.0]);

    let both = world.find_entities_with::<(&Velocity, &Position)>();
    let matches: Vec<_> = both.iter().collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].entity(), moving);
    assert_eq!(matches[0].components.0, &vel(2.0));
    drop(matches);
    drop(both);

    assert!(world.destroy_entity(&named));
    assert!(!named.is_alive());
    assert_eq!(world.find_entities_with::<(&Name,)>().iter().count(), 0);
    assert_eq!(world.entity_count(), 2);
}

#[test]
fn test_unknown_query_is_empty() {
    let world = small_world();
    world.create_entity((pos(0.0),)).unwrap();
    let selection = world.find_entities_with::<(&Name,)>();
    assert!(selection.is_empty());
    assert_eq!(selection.composition_count(), 0);
}

#[test]
fn test_ids_restart_per_chunk() {
    let world = small_world();
    let first = world.create_entity((pos(0.0),)).unwrap();
    let second = world.create_entity((pos(1.0),)).unwrap();
    let other = world.create_entity((vel(0.0),)).unwrap();

    assert_eq!(first.id(), 0);
    assert_eq!(second.id(), 1);
    // Second composition rents the pool's second chunk.
    assert_eq!(other.id(), 1 << 4);
}

#[test]
fn test_destroy_then_create_reuses_vacated_tail() {
    let world = small_world();
    let entities: Vec<Entity> = (0..3)
        .map(|i| world.create_entity((pos(i as f32),)).unwrap())
        .collect();

    assert!(world.destroy_entity(&entities[0]));
    // The tail entity filled the hole.
    assert_eq!(entities[2].id(), 0);
    assert_eq!(world.with_component(&entities[2], |p: &Position| p.x), Some(2.0));

    let reused = world.create_entity((pos(9.0),)).unwrap();
    assert_eq!(reused.id(), 2);
}

#[test]
fn test_single_entity_reuses_zero() {
    let world = small_world();
    let only = world.create_entity((Health(1),)).unwrap();
    assert!(world.destroy_entity(&only));
    let next = world.create_entity((Health(2),)).unwrap();
    assert_eq!(next.id(), 0);
}

#[test]
fn test_fill_several_chunks() {
    let world = small_world();
    let entities: Vec<Entity> = (0..40)
        .map(|i| world.create_entity((Health(i),)).unwrap())
        .collect();
    let composition = entities[0].composition().unwrap();
    assert_eq!(composition.tenant().chunk_count(), 3);

    let schema = IdSchema::new(4, None).unwrap();
    for entity in &entities[..16] {
        assert_eq!(schema.fetch_chunk_id(entity.id()), 0);
    }

    // Freed ids in full chunks are handed out before the current chunk grows.
    assert!(world.destroy_entity(&entities[3]));
    let refill = world.create_entity((Health(100),)).unwrap();
    assert_eq!(schema.fetch_chunk_id(refill.id()), 0);
    assert_eq!(schema.fetch_object_id(refill.id()), 15);

    let mut total: u32 = world
        .find_entities_with::<(&Health,)>()
        .iter()
        .map(|m| m.components.0 .0)
        .sum();
    total -= 100;
    assert_eq!(total, (0..40).sum::<u32>() - 3);
}

#[test]
fn test_capacity_exhausted() {
    let world = World::with_config(
        EngineConfig::default()
            .with_chunk_bit(2)
            .with_max_chunks(2),
    )
    .unwrap();
    for _ in 0..8 {
        world.create_entity((Health(0),)).unwrap();
    }
    let err = world.create_entity((Health(0),)).unwrap_err();
    assert!(matches!(err, EcsError::ChunkCapacityExhausted { max_chunks: 2 }));
    assert!(err.is_fatal());

    // A new composition needs a chunk too.
    assert!(world.create_entity((pos(0.0),)).is_err());
}

#[test]
fn test_duplicate_bundle_type() {
    let world = small_world();
    let err = world.create_entity((pos(0.0), vel(0.0), pos(1.0))).unwrap_err();
    assert!(matches!(err, EcsError::DuplicateComponentType(_)));
    assert_eq!(world.entity_count(), 0);
}

#[test]
fn test_migration_round_trip() {
    let world = small_world();
    let entity = world.create_entity((pos(1.0),)).unwrap();
    let bystander = world.create_entity((pos(2.0),)).unwrap();
    let start = entity.composition().unwrap();

    world.add_component(&entity, vel(5.0)).unwrap();
    world.add_component(&entity, Name("mover".into())).unwrap();
    let moved = entity.composition().unwrap();
    assert_eq!(moved.component_count(), 3);
    assert!(moved.contains(TypeId::of::<Name>()));
    assert_eq!(start.size(), 1);
    assert_eq!(bystander.id(), 0);

    assert_eq!(world.remove_component::<Velocity>(&entity), Ok(vel(5.0)));
    assert_eq!(world.remove_component::<Name>(&entity), Ok(Name("mover".into())));
    assert!(std::sync::Arc::ptr_eq(&entity.composition().unwrap(), &start));
    assert_eq!(world.with_component(&entity, |p: &Position| *p), Some(pos(1.0)));
    assert_eq!(world.find_entities_with::<(&Position,)>().iter().count(), 2);
}

#[test]
fn test_selection_from_composition_create() {
    let world = small_world();
    let composition = world
        .repository()
        .get_or_create_bundle::<(Position, Velocity)>()
        .unwrap();
    composition.create_entity((vel(1.0), pos(1.0))).unwrap();
    let via_world = world.create_entity((pos(2.0), vel(2.0))).unwrap();
    assert!(std::sync::Arc::ptr_eq(&via_world.composition().unwrap(), &composition));
    assert_eq!(world.find_entities_with::<(&Velocity,)>().len(), 2);
}

#[test]
fn test_config_from_json() {
    let config = EngineConfig::from_json_str(r#"{ "chunk_bit": 3, "system_timeout_ms": 7000 }"#)
        .unwrap();
    let world = World::with_config(config).unwrap();
    assert_eq!(world.config().system_timeout().as_secs(), 7);
    let entities: Vec<Entity> = (0..9)
        .map(|i| world.create_entity((Health(i),)).unwrap())
        .collect();
    assert_eq!(entities[8].id(), 1 << 3);

    assert!(matches!(
        World::with_config(EngineConfig::default().with_chunk_bit(1)),
        Err(EcsError::InvalidConfig(_))
    ));
}

#[test]
fn test_two_archetypes_find_and_reuse() {
    let world = small_world();
    let first = world.create_entity((Health(0),)).unwrap();
    let second = world.create_entity((Health(0), pos(0.0))).unwrap();
    let first_composition = first.composition().unwrap();
    let second_composition = second.composition().unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first_composition, &second_composition));

    let repository = world.repository();
    let health_only = repository.find_compositions(&[TypeId::of::<Health>()]);
    assert_eq!(health_only.len(), 2);
    let both = repository.find_compositions(&[TypeId::of::<Health>(), TypeId::of::<Position>()]);
    assert_eq!(both.len(), 1);
    assert!(std::sync::Arc::ptr_eq(&both[0], &second_composition));

    let freed = first.id();
    assert!(world.destroy_entity(&first));
    let next = world.create_entity((Health(1),)).unwrap();
    assert_eq!(next.id(), freed);
}

#[test]
fn test_selection_dropped_after_iteration() {
    let world = small_world();
    for i in 0..3 {
        world.create_entity((pos(i as f32), vel(1.0))).unwrap();
    }

    let selection = world.find_entities_with::<(&Position, &Velocity)>();
    let found: Vec<Entity> = selection.iter().map(|m| m.entity()).collect();
    let speed: f32 = selection.iter().map(|m| m.components.1.x).sum();
    assert_eq!(speed, 3.0);
    let moved = selection;
    assert_eq!(moved.len(), 3);
    drop(moved);

    // Exclusive tenant work on this thread needs the shared locks released.
    world.add_component(&found[0], Health(1)).unwrap();
    for entity in &found {
        assert!(world.destroy_entity(entity));
    }
    assert_eq!(world.entity_count(), 0);
}
