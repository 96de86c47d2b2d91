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

//! Data composition: the storage of one exact component set
//!
//! Component columns are kept in canonical order, ascending by class index.
//! A dense `class index -> slot` table resolves a type's column in O(1).

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::bitset::BitSet;
use crate::class_index::ClassIndex;
use crate::component::{Bundle, ComponentInfo, ErasedComponent, MAX_BUNDLE_COMPONENTS};
use crate::entity::{Entity, EntityRecord};
use crate::error::{EcsError, Result};
use crate::pool::{ChunkedPool, Tenant};
use crate::query::{QueryFilter, Selection};
use crate::sparse::SparseIntMap;

const ABSENT_SLOT: i32 = -1;

/// Storage for every entity with exactly one component set
pub struct DataComposition {
    key: u64,
    class_index: Arc<ClassIndex>,
    component_types: Box<[ComponentInfo]>,
    class_indices: Box<[u32]>,
    component_index: Box<[i32]>,
    tenant: Tenant<EntityRecord>,
}

impl DataComposition {
    pub(crate) fn new(
        key: u64,
        class_index: Arc<ClassIndex>,
        pool: &Arc<ChunkedPool<EntityRecord>>,
        types: &SparseIntMap<ComponentInfo>,
    ) -> Result<Self> {
        let class_indices = types.sorted_keys();
        let component_types: Vec<ComponentInfo> = class_indices
            .iter()
            .filter_map(|&index| types.get(index).copied())
            .collect();

        let table_len = class_indices.last().map_or(0, |&max| max as usize + 1);
        let mut component_index = vec![ABSENT_SLOT; table_len];
        for (slot, &index) in class_indices.iter().enumerate() {
            component_index[index as usize] = slot as i32;
        }

        let tenant = pool.new_tenant(&component_types)?;
        Ok(Self {
            key,
            class_index,
            component_types: component_types.into_boxed_slice(),
            class_indices: class_indices.into_boxed_slice(),
            component_index: component_index.into_boxed_slice(),
            tenant,
        })
    }

    /// Archetype key of the owning node
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Component types in slot order
    pub fn component_types(&self) -> &[ComponentInfo] {
        &self.component_types
    }

    /// Class indices in slot order, ascending
    pub fn class_indices(&self) -> &[u32] {
        &self.class_indices
    }

    pub fn component_count(&self) -> usize {
        self.component_types.len()
    }

    pub fn tenant(&self) -> &Tenant<EntityRecord> {
        &self.tenant
    }

    /// Number of entities stored
    pub fn size(&self) -> usize {
        self.tenant.size()
    }

    #[inline]
    fn slot_of(&self, class_index: u32) -> Option<usize> {
        match self.component_index.get(class_index as usize) {
            Some(&slot) if slot != ABSENT_SLOT => Some(slot as usize),
            _ => None,
        }
    }

    /// Column slot of `type_id`, `None` when not part of this composition
    pub fn fetch_component_index(&self, type_id: TypeId) -> Option<usize> {
        self.slot_of(self.class_index.get_index(type_id)?)
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.fetch_component_index(type_id).is_some()
    }

    /// Reorder `components` into slot order.
    ///
    /// Each position keeps swapping its element to that element's slot until
    /// it holds its own, so any permutation ends in canonical order.
    pub fn sort_components_in_place_by_index(
        &self,
        components: &mut [ErasedComponent],
    ) -> Result<()> {
        let mut slots: SmallVec<[usize; MAX_BUNDLE_COMPONENTS]> = SmallVec::new();
        for component in components.iter() {
            let slot = self
                .fetch_component_index(component.type_id())
                .ok_or(EcsError::ComponentNotFound(component.info().name()))?;
            slots.push(slot);
        }
        if components.len() != self.component_types.len() {
            return Err(self.mismatch(components, &slots));
        }

        for i in 0..components.len() {
            loop {
                let target = slots[i];
                if target == i {
                    break;
                }
                if slots[target] == target {
                    return Err(EcsError::DuplicateComponentType(
                        components[i].info().name(),
                    ));
                }
                components.swap(i, target);
                slots.swap(i, target);
            }
        }
        Ok(())
    }

    fn mismatch(&self, components: &[ErasedComponent], slots: &[usize]) -> EcsError {
        let mut seen = BitSet::with_capacity(self.component_types.len());
        for (component, &slot) in components.iter().zip(slots) {
            if !seen.insert(slot) {
                return EcsError::DuplicateComponentType(component.info().name());
            }
        }
        let missing = (0..self.component_types.len())
            .find(|&slot| !seen.contains(slot))
            .map_or("<unknown>", |slot| self.component_types[slot].name());
        EcsError::ComponentNotFound(missing)
    }

    /// Create an entity from a bundle of exactly this composition's types
    pub fn create_entity<B: Bundle>(self: &Arc<Self>, bundle: B) -> Result<Entity> {
        bundle.take_components(|components| {
            let record = Arc::new(EntityRecord::new(self));
            self.insert_erased(&record, components)?;
            Ok(Entity::from_record(record))
        })
    }

    /// Move `components` into a new slot owned by `record`.
    ///
    /// On success every component has been moved out; on error none has.
    pub(crate) fn insert_erased(
        self: &Arc<Self>,
        record: &Arc<EntityRecord>,
        components: &mut [ErasedComponent],
    ) -> Result<u32> {
        self.sort_components_in_place_by_index(components)?;
        record.set_composition(self);
        self.tenant.insert_with(Arc::clone(record), |row| {
            for (slot, component) in components.iter().enumerate() {
                // SAFETY: slot order matches the columns after sorting.
                unsafe { component.move_to(row.component_ptr(slot)) };
            }
        })
    }

    /// Selection over this composition alone, `None` when a queried type is missing
    pub fn select<Q: QueryFilter>(self: &Arc<Self>) -> Option<Selection<Q>> {
        Q::slots(self)?;
        Some(Selection::new([Arc::clone(self)]))
    }
}

impl fmt::Debug for DataComposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataComposition")
            .field("key", &self.key)
            .field("types", &self.component_types)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::IdSchema;

    #[derive(Debug, PartialEq)]
    struct A(u32);
    #[derive(Debug, PartialEq)]
    struct B(u64);
    #[derive(Debug, PartialEq)]
    struct C(u8);
    #[derive(Debug, PartialEq)]
    struct D(i16);
    #[derive(Debug, PartialEq)]
    struct E(u16);

    fn composition(infos: &[ComponentInfo]) -> Arc<DataComposition> {
        let class_index = Arc::new(ClassIndex::new(8, 16).unwrap());
        let pool = Arc::new(ChunkedPool::new(IdSchema::new(4, None).unwrap()));
        let mut types = SparseIntMap::new();
        for info in infos {
            types.put(class_index.get_index_or_add_class(info).unwrap(), *info);
        }
        let key = types.sorted_keys_hash_code();
        Arc::new(DataComposition::new(key, class_index, &pool, &types).unwrap())
    }

    fn five() -> [ComponentInfo; 5] {
        [
            ComponentInfo::of::<A>(),
            ComponentInfo::of::<B>(),
            ComponentInfo::of::<C>(),
            ComponentInfo::of::<D>(),
            ComponentInfo::of::<E>(),
        ]
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![vec![]];
        }
        let mut result = Vec::new();
        for perm in permutations(n - 1) {
            for pos in 0..n {
                let mut next = perm.clone();
                next.insert(pos, n - 1);
                result.push(next);
            }
        }
        result
    }

    #[test]
    fn test_slot_table() {
        let infos = five();
        let comp = composition(&infos);
        assert_eq!(comp.class_indices(), &[1, 2, 3, 4, 5]);
        for (slot, info) in infos.iter().enumerate() {
            assert_eq!(comp.fetch_component_index(info.type_id()), Some(slot));
        }
        assert_eq!(comp.fetch_component_index(TypeId::of::<String>()), None);
    }

    #[test]
    fn test_sort_every_permutation() {
        let infos = five();
        let comp = composition(&infos);
        let mut values = [0u8; 5];

        for perm in permutations(5) {
            let mut erased: Vec<ErasedComponent> = perm
                .iter()
                .map(|&i| unsafe {
                    ErasedComponent::new(infos[i], &mut values[i] as *mut u8)
                })
                .collect();
            comp.sort_components_in_place_by_index(&mut erased).unwrap();
            let order: Vec<TypeId> = erased.iter().map(|c| c.type_id()).collect();
            let canonical: Vec<TypeId> = infos.iter().map(|i| i.type_id()).collect();
            assert_eq!(order, canonical, "permutation {perm:?}");
        }
    }

    #[test]
    fn test_sort_full_cycle() {
        let infos = five();
        let comp = composition(&infos);
        let mut value = 0u8;
        let ptr = &mut value as *mut u8;
        // Every element sits one slot to the left of its target.
        let mut erased: Vec<ErasedComponent> = [1, 2, 3, 4, 0]
            .iter()
            .map(|&i| unsafe { ErasedComponent::new(infos[i], ptr) })
            .collect();
        comp.sort_components_in_place_by_index(&mut erased).unwrap();
        assert_eq!(erased[0].type_id(), TypeId::of::<A>());
        assert_eq!(erased[4].type_id(), TypeId::of::<E>());
    }

    #[test]
    fn test_sort_rejects_foreign_missing_and_duplicate() {
        let infos = five();
        let comp = composition(&infos[..3]);
        let mut value = 0u8;
        let ptr = &mut value as *mut u8;
        let erase = |list: &[ComponentInfo]| -> Vec<ErasedComponent> {
            list.iter()
                .map(|info| unsafe { ErasedComponent::new(*info, ptr) })
                .collect()
        };

        let mut foreign = erase(&[infos[0], infos[1], infos[4]]);
        assert!(matches!(
            comp.sort_components_in_place_by_index(&mut foreign),
            Err(EcsError::ComponentNotFound(_))
        ));

        let mut missing = erase(&[infos[2], infos[0]]);
        assert_eq!(
            comp.sort_components_in_place_by_index(&mut missing),
            Err(EcsError::ComponentNotFound(infos[1].name()))
        );

        let mut duplicate = erase(&[infos[1], infos[0], infos[1]]);
        assert_eq!(
            comp.sort_components_in_place_by_index(&mut duplicate),
            Err(EcsError::DuplicateComponentType(infos[1].name()))
        );
    }

    #[test]
    fn test_create_entity_any_order() {
        let comp = composition(&[ComponentInfo::of::<A>(), ComponentInfo::of::<B>()]);
        let first = comp.create_entity((A(1), B(10))).unwrap();
        let second = comp.create_entity((B(20), A(2))).unwrap();
        assert_eq!(comp.size(), 2);
        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);
        assert!(Arc::ptr_eq(&second.composition().unwrap(), &comp));

        let selection = comp.select::<(&A, &B)>().unwrap();
        let rows: Vec<(u32, u64)> = selection
            .iter()
            .map(|m| (m.components.0 .0, m.components.1 .0))
            .collect();
        assert_eq!(rows, vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn test_create_entity_wrong_bundle() {
        let comp = composition(&[ComponentInfo::of::<A>(), ComponentInfo::of::<B>()]);
        assert!(matches!(
            comp.create_entity((A(1), C(1))),
            Err(EcsError::ComponentNotFound(_))
        ));
        assert_eq!(comp.size(), 0);
        assert!(comp.select::<(&C,)>().is_none());
    }
}
