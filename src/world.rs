// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! World: the entity facade over the composition repository

use std::any::{type_name, TypeId};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::Arc;
use std::thread;

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::component::{Bundle, Component, ComponentInfo, ErasedComponent, MAX_BUNDLE_COMPONENTS};
use crate::composition::DataComposition;
use crate::config::EngineConfig;
use crate::entity::{Entity, EntityRecord, IdSchema, Identifiable};
use crate::error::{EcsError, Result};
use crate::memory::RawBlock;
use crate::pool::{Row, Vacate};
use crate::query::{QueryFilter, Selection};
use crate::repository::CompositionRepository;

/// Central ECS world
///
/// Every method takes `&self`; share a world across threads by reference or
/// inside an `Arc`.
pub struct World {
    config: EngineConfig,
    repository: CompositionRepository,
    /// Bundle type -> composition, skips canonicalization on repeat creates
    bundles: RwLock<AHashMap<TypeId, Arc<DataComposition>>>,
}

impl World {
    /// World with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let repository = CompositionRepository::new(&config)?;
        Ok(Self {
            config,
            repository,
            bundles: RwLock::new(AHashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &CompositionRepository {
        &self.repository
    }

    fn bundle_composition<B: Bundle>(&self) -> Result<Arc<DataComposition>> {
        let bundle_id = TypeId::of::<B>();
        if let Some(composition) = self.bundles.read().get(&bundle_id) {
            return Ok(Arc::clone(composition));
        }
        let composition = self.repository.get_or_create_bundle::<B>()?;
        self.bundles
            .write()
            .entry(bundle_id)
            .or_insert_with(|| Arc::clone(&composition));
        Ok(composition)
    }

    /// Spawn an entity holding every component of `bundle`.
    ///
    /// Component order does not matter; `(A, B)` and `(B, A)` land in the
    /// same composition.
    pub fn create_entity<B: Bundle>(&self, bundle: B) -> Result<Entity> {
        #[cfg(feature = "profiling")]
        let span = info_span!("world.create_entity", components = B::component_infos().len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        self.bundle_composition::<B>()?.create_entity(bundle)
    }

    /// Destroy an entity and drop its components.
    ///
    /// Returns false if it was already destroyed or belongs to another world.
    pub fn destroy_entity(&self, entity: &Entity) -> bool {
        let record = entity.record();
        self.access(entity, |composition, id| {
            composition.tenant().vacate_with(id, |row| {
                if !row.holds(record) || !record.try_detach(row.id()) {
                    return Err(EcsError::EntityNotFound);
                }
                Ok(((), Vacate::Drop))
            })
        })
        .is_ok()
    }

    /// Lazy selection of every entity holding all of `Q`'s component types.
    ///
    /// The selection pins the matched compositions with shared locks; see
    /// [`Selection`] for what must not happen while it is alive.
    pub fn find_entities_with<Q: QueryFilter>(&self) -> Selection<Q> {
        #[cfg(feature = "profiling")]
        let span = info_span!("world.find_entities_with", types = Q::type_ids().len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let type_ids = Q::type_ids();
        Selection::new(self.repository.find_compositions(&type_ids))
    }

    /// Read one component under the tenant's shared lock
    pub fn with_component<T: Component, R>(
        &self,
        entity: &Entity,
        f: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let record = entity.record();
        let mut pending = Some(f);
        self.access(entity, |composition, id| {
            let slot = slot_of::<T>(composition)?;
            composition.tenant().with_row(id, |row| {
                let f = take_if_held(row, record, &mut pending)?;
                // SAFETY: published row, column `slot` holds a `T`.
                Ok(f(unsafe { &*(row.component_ptr(slot) as *const T) }))
            })?
        })
        .ok()
    }

    /// Mutate one component under the tenant's exclusive lock.
    ///
    /// `f` must not call back into this world.
    pub fn with_component_mut<T: Component, R>(
        &self,
        entity: &Entity,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let record = entity.record();
        let mut pending = Some(f);
        self.access(entity, |composition, id| {
            let slot = slot_of::<T>(composition)?;
            composition.tenant().with_row_mut(id, |row| {
                let f = take_if_held(row, record, &mut pending)?;
                // SAFETY: exclusive lock held, column `slot` holds a `T`.
                Ok(f(unsafe { &mut *(row.component_ptr(slot) as *mut T) }))
            })?
        })
        .ok()
    }

    pub fn has_component<T: Component>(&self, entity: &Entity) -> bool {
        entity.is_alive()
            && entity
                .composition()
                .is_some_and(|composition| composition.contains(TypeId::of::<T>()))
    }

    /// Add `value` to an entity, replacing an existing `T` in place.
    ///
    /// A new type moves the entity to the composition that also holds `T`.
    /// If that move fails the entity is destroyed.
    pub fn add_component<T: Component>(&self, entity: &Entity, value: T) -> Result<()> {
        let record = entity.record();
        let mut pending = Some(value);
        self.access(entity, |composition, id| {
            if let Some(slot) = composition.fetch_component_index(TypeId::of::<T>()) {
                return composition.tenant().with_row_mut(id, |row| {
                    let value = take_if_held(row, record, &mut pending)?;
                    // SAFETY: exclusive lock held; assignment drops the old value.
                    unsafe { *(row.component_ptr(slot) as *mut T) = value };
                    Ok(())
                })?;
            }

            let mut infos: SmallVec<[ComponentInfo; MAX_BUNDLE_COMPONENTS]> =
                composition.component_types().into();
            infos.push(ComponentInfo::of::<T>());
            let target = self.repository.get_or_create(&infos)?;

            let detached = detach_components(composition, record, id)?;
            let mut value = ManuallyDrop::new(pending.take().ok_or(EcsError::EntityNotFound)?);
            // SAFETY: `value` stays alive until `attach` returns.
            let extra = unsafe {
                ErasedComponent::new(ComponentInfo::of::<T>(), &mut *value as *mut T as *mut u8)
            };
            let result = attach(&target, record, detached, Some(extra));
            if result.is_err() {
                // SAFETY: nothing was moved out of `value`.
                unsafe { ManuallyDrop::drop(&mut value) };
            }
            result
        })
    }

    /// Take `T` off an entity, moving it to the composition without `T`
    pub fn remove_component<T: Component>(&self, entity: &Entity) -> Result<T> {
        let record = entity.record();
        self.access(entity, |composition, id| {
            slot_of::<T>(composition)?;
            let infos: SmallVec<[ComponentInfo; MAX_BUNDLE_COMPONENTS]> = composition
                .component_types()
                .iter()
                .filter(|info| info.type_id() != TypeId::of::<T>())
                .copied()
                .collect();
            let target = self.repository.get_or_create(&infos)?;

            let mut detached = detach_components(composition, record, id)?;
            let value = detached
                .take::<T>()
                .ok_or(EcsError::ComponentNotFound(type_name::<T>()))?;
            attach(&target, record, detached, None)?;
            Ok(value)
        })
    }

    /// Live entities across every composition
    pub fn entity_count(&self) -> usize {
        self.repository
            .compositions()
            .iter()
            .map(|composition| composition.size())
            .sum()
    }

    /// Materialized compositions, the empty one included once used
    pub fn composition_count(&self) -> usize {
        self.repository.compositions().len()
    }

    /// Run `f` against the entity's current composition and flag-free id.
    ///
    /// `f` answers [`EcsError::EntityNotFound`] when the row no longer holds
    /// the entity; the id is then re-read and `f` retried. Ids in transit are
    /// waited out.
    fn access<R>(
        &self,
        entity: &Entity,
        mut f: impl FnMut(&Arc<DataComposition>, u32) -> Result<R>,
    ) -> Result<R> {
        let record = entity.record();
        loop {
            let id = record.id();
            if IdSchema::is_detached(id) {
                return Err(EcsError::EntityNotFound);
            }
            if IdSchema::is_reserved(id) {
                thread::yield_now();
                continue;
            }
            let composition = record.composition().ok_or(EcsError::EntityNotFound)?;
            if !Arc::ptr_eq(composition.tenant().pool(), self.repository.pool()) {
                return Err(EcsError::EntityNotFound);
            }
            match f(&composition, id) {
                Err(EcsError::EntityNotFound) => thread::yield_now(),
                result => return result,
            }
        }
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entity_count())
            .field("compositions", &self.composition_count())
            .field("config", &self.config)
            .finish()
    }
}

fn slot_of<T: Component>(composition: &DataComposition) -> Result<usize> {
    composition
        .fetch_component_index(TypeId::of::<T>())
        .ok_or(EcsError::ComponentNotFound(type_name::<T>()))
}

/// Take the pending argument once the row is confirmed to hold `record`
fn take_if_held<V>(
    row: &Row<'_, EntityRecord>,
    record: &Arc<EntityRecord>,
    pending: &mut Option<V>,
) -> Result<V> {
    if !row.holds(record) {
        return Err(EcsError::EntityNotFound);
    }
    pending.take().ok_or(EcsError::EntityNotFound)
}

/// Move the entity's components out of its row and free the row.
///
/// The entity's id carries the reserved flag on return.
fn detach_components(
    composition: &DataComposition,
    record: &Arc<EntityRecord>,
    id: u32,
) -> Result<DetachedComponents> {
    let (detached, _) = composition.tenant().vacate_with(id, |row| {
        if !row.holds(record) {
            return Err(EcsError::EntityNotFound);
        }
        let mut detached = DetachedComponents::allocate(composition.component_types())?;
        if !record.try_reserve(row.id()) {
            return Err(EcsError::EntityNotFound);
        }
        // SAFETY: the row is published and the exclusive lock is held.
        unsafe { detached.move_from(row) };
        Ok((detached, Vacate::Forget))
    })?;
    Ok(detached)
}

/// Insert detached components plus `extra` into `target`.
///
/// On failure the entity is destroyed and the detached components dropped.
fn attach(
    target: &Arc<DataComposition>,
    record: &Arc<EntityRecord>,
    mut detached: DetachedComponents,
    extra: Option<ErasedComponent>,
) -> Result<()> {
    let mut components = detached.erased();
    components.extend(extra);
    match target.insert_erased(record, &mut components) {
        Ok(_) => {
            detached.forget();
            Ok(())
        }
        Err(err) => {
            record.detach();
            Err(err)
        }
    }
}

struct DetachedPart {
    info: ComponentInfo,
    block: RawBlock,
    live: bool,
}

/// Component values of an entity in transit between compositions
struct DetachedComponents {
    parts: SmallVec<[DetachedPart; MAX_BUNDLE_COMPONENTS]>,
}

impl DetachedComponents {
    fn allocate(layout: &[ComponentInfo]) -> Result<Self> {
        let parts = layout
            .iter()
            .map(|info| {
                Ok(DetachedPart {
                    info: *info,
                    block: RawBlock::allocate(info.layout())?,
                    live: false,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { parts })
    }

    /// # Safety
    /// `row` must be published and its columns must match the allocated layout.
    unsafe fn move_from(&mut self, row: &Row<'_, EntityRecord>) {
        for (slot, part) in self.parts.iter_mut().enumerate() {
            ptr::copy_nonoverlapping(
                row.component_ptr(slot),
                part.block.as_ptr(),
                part.info.layout().size(),
            );
            part.live = true;
        }
    }

    fn take<T: Component>(&mut self) -> Option<T> {
        let pos = self
            .parts
            .iter()
            .position(|part| part.live && part.info.type_id() == TypeId::of::<T>())?;
        let part = self.parts.remove(pos);
        // SAFETY: a live part of type `T` holds an initialized `T`.
        Some(unsafe { ptr::read(part.block.as_ptr() as *const T) })
    }

    fn erased(&self) -> SmallVec<[ErasedComponent; MAX_BUNDLE_COMPONENTS]> {
        self.parts
            .iter()
            .filter(|part| part.live)
            // SAFETY: live parts hold initialized values.
            .map(|part| unsafe { ErasedComponent::new(part.info, part.block.as_ptr()) })
            .collect()
    }

    /// Every value has been moved out
    fn forget(&mut self) {
        for part in self.parts.iter_mut() {
            part.live = false;
        }
    }
}

impl Drop for DetachedComponents {
    fn drop(&mut self) {
        for part in self.parts.iter().filter(|part| part.live) {
            // SAFETY: live parts own their values.
            unsafe { part.info.drop_value(part.block.as_ptr()) };
        }
    }
}
