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

//! Query system over data compositions
//!
//! Type-safe component queries. A [`Selection`] pins every matched tenant
//! with a shared lock and iterates lazily, reading components straight from
//! chunk columns.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::component::Component;
use crate::composition::DataComposition;
use crate::entity::{Entity, EntityRecord, Identifiable};
use crate::pool::{LinkedChunk, TenantReadGuard};

const MAX_QUERY_COMPONENTS: usize = 8;

/// Query filter trait for type-level composition matching
pub trait QueryFilter {
    /// Column slots resolved once per composition
    type Slots: Copy + Send + Sync;

    /// Get required component type IDs
    fn type_ids() -> SmallVec<[TypeId; MAX_QUERY_COMPONENTS]>;

    /// Resolve column slots, `None` if the composition lacks a type
    fn slots(composition: &DataComposition) -> Option<Self::Slots>;
}

/// Trait for fetching component data
///
/// The item borrows from the selection being iterated, not from the query
/// type, so a selection can be dropped as soon as its matches are.
///
/// # Safety
/// `fetch` must only read the columns bound by `bind`.
pub unsafe trait QueryFetch: QueryFilter {
    /// The type of data returned by the query
    type Item<'s>;
    /// Per-chunk column pointers
    type State: Copy;

    /// Bind resolved slots to one chunk
    fn bind(slots: Self::Slots, chunk: &LinkedChunk<EntityRecord>) -> Self::State;

    /// Fetch data for a specific row
    ///
    /// # Safety
    /// - `row` must hold a published entity of the chunk used in `bind`
    /// - that chunk must stay pinned for `'s`
    unsafe fn fetch<'s>(state: Self::State, row: usize) -> Self::Item<'s>;
}

impl<T: Component> QueryFilter for &T {
    type Slots = usize;

    fn type_ids() -> SmallVec<[TypeId; MAX_QUERY_COMPONENTS]> {
        smallvec![TypeId::of::<T>()]
    }

    fn slots(composition: &DataComposition) -> Option<usize> {
        composition.fetch_component_index(TypeId::of::<T>())
    }
}

unsafe impl<T: Component> QueryFetch for &T {
    type Item<'s> = &'s T;
    type State = *const T;

    fn bind(slot: usize, chunk: &LinkedChunk<EntityRecord>) -> *const T {
        chunk.columns()[slot].ptr_at(0) as *const T
    }

    unsafe fn fetch<'s>(state: *const T, row: usize) -> &'s T {
        &*state.add(row)
    }
}

// Macro for tuple query implementations
macro_rules! impl_query {
    ($($T:ident),+) => {
        impl<$($T: QueryFilter),+> QueryFilter for ($($T,)+) {
            type Slots = ($($T::Slots,)+);

            fn type_ids() -> SmallVec<[TypeId; MAX_QUERY_COMPONENTS]> {
                let mut ids = SmallVec::new();
                $(ids.extend($T::type_ids());)+
                ids
            }

            fn slots(composition: &DataComposition) -> Option<Self::Slots> {
                Some(($($T::slots(composition)?,)+))
            }
        }

        unsafe impl<$($T: QueryFetch),+> QueryFetch for ($($T,)+) {
            type Item<'s> = ($($T::Item<'s>,)+);
            type State = ($($T::State,)+);

            #[allow(non_snake_case)]
            fn bind(slots: Self::Slots, chunk: &LinkedChunk<EntityRecord>) -> Self::State {
                let ($($T,)+) = slots;
                ($($T::bind($T, chunk),)+)
            }

            #[allow(non_snake_case)]
            unsafe fn fetch<'s>(state: Self::State, row: usize) -> Self::Item<'s> {
                let ($($T,)+) = state;
                ($($T::fetch($T, row),)+)
            }
        }
    };
}

impl_query!(A);
impl_query!(A, B);
impl_query!(A, B, C);
impl_query!(A, B, C, D);
impl_query!(A, B, C, D, E);
impl_query!(A, B, C, D, E, F);
impl_query!(A, B, C, D, E, F, G);
impl_query!(A, B, C, D, E, F, G, H);

/// One matched entity
pub struct MatchRecord<'s, I> {
    /// Requested components, in query order
    pub components: I,
    record: &'s EntityRecord,
}

impl<'s, I> MatchRecord<'s, I> {
    /// Entity id at the time of the match
    pub fn id(&self) -> u32 {
        self.record.id()
    }

    pub fn entity(&self) -> Entity {
        let ptr = self.record as *const EntityRecord;
        // SAFETY: the record was published from `Arc::into_raw` and its slot
        // keeps a strong count while the selection holds the tenant lock.
        unsafe {
            Arc::increment_strong_count(ptr);
            Entity::from_record(Arc::from_raw(ptr))
        }
    }
}

impl<'s, I: fmt::Debug> fmt::Debug for MatchRecord<'s, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchRecord")
            .field("id", &self.id())
            .field("components", &self.components)
            .finish()
    }
}

struct SelectionPart<Q: QueryFilter> {
    composition: Arc<DataComposition>,
    slots: Q::Slots,
    guard: TenantReadGuard<EntityRecord>,
}

/// Matched compositions, each pinned by a shared tenant lock.
///
/// Entities can still be created in the pinned tenants while a chunk has
/// room. Anything needing a pinned tenant's exclusive lock (destroy, component
/// add/remove, `with_component_mut`, chunk rollover) waits for the selection to
/// drop, and deadlocks when issued from the thread holding it.
pub struct Selection<Q: QueryFilter> {
    parts: Vec<SelectionPart<Q>>,
}

impl<Q: QueryFilter> Selection<Q> {
    pub(crate) fn new(compositions: impl IntoIterator<Item = Arc<DataComposition>>) -> Self {
        let parts = compositions
            .into_iter()
            .filter_map(|composition| {
                let slots = Q::slots(&composition)?;
                let guard = composition.tenant().read_guard();
                Some(SelectionPart {
                    composition,
                    slots,
                    guard,
                })
            })
            .collect();
        Self { parts }
    }

    pub fn empty() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn compositions(&self) -> impl Iterator<Item = &Arc<DataComposition>> {
        self.parts.iter().map(|part| &part.composition)
    }

    pub fn composition_count(&self) -> usize {
        self.parts.len()
    }

    /// Claimed slots across every matched chunk
    pub fn len(&self) -> usize {
        self.parts
            .iter()
            .flat_map(|part| part.guard.chunks())
            .map(|chunk| chunk.size())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> SelectionIter<'_, Q>
    where
        Q: QueryFetch,
    {
        let no_chunks: &[Arc<LinkedChunk<EntityRecord>>] = &[];
        SelectionIter {
            parts: self.parts.iter(),
            chunks: no_chunks.iter(),
            slots: None,
            current: None,
            row: 0,
            end: 0,
        }
    }

    /// Run `func` for every match, one rayon task per chunk
    #[cfg(feature = "parallel")]
    pub fn par_for_each<'s, F>(&'s self, func: F)
    where
        Q: QueryFetch,
        F: Fn(MatchRecord<'s, Q::Item<'s>>) + Send + Sync,
    {
        use rayon::prelude::*;

        let chunks: Vec<(&'s LinkedChunk<EntityRecord>, Q::Slots)> = self
            .parts
            .iter()
            .flat_map(|part| part.guard.chunks().iter().map(move |chunk| (&**chunk, part.slots)))
            .collect();

        chunks.par_iter().for_each(|&(chunk, slots)| {
            let state = Q::bind(slots, chunk);
            for row in 0..chunk.size() {
                if let Some(record) = chunk.item(row) {
                    // SAFETY: the row is published and the tenant lock is held.
                    let components = unsafe { Q::fetch(state, row) };
                    func(MatchRecord { components, record });
                }
            }
        });
    }
}

impl<'s, Q: QueryFetch> IntoIterator for &'s Selection<Q> {
    type Item = MatchRecord<'s, Q::Item<'s>>;
    type IntoIter = SelectionIter<'s, Q>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over a selection
pub struct SelectionIter<'s, Q: QueryFetch> {
    parts: std::slice::Iter<'s, SelectionPart<Q>>,
    chunks: std::slice::Iter<'s, Arc<LinkedChunk<EntityRecord>>>,
    slots: Option<Q::Slots>,
    current: Option<(&'s LinkedChunk<EntityRecord>, Q::State)>,
    row: usize,
    end: usize,
}

impl<'s, Q: QueryFetch> Iterator for SelectionIter<'s, Q> {
    type Item = MatchRecord<'s, Q::Item<'s>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((chunk, state)) = self.current {
                while self.row < self.end {
                    let row = self.row;
                    self.row += 1;
                    if let Some(record) = chunk.item(row) {
                        // SAFETY: published row of the chunk bound into `state`.
                        let components = unsafe { Q::fetch(state, row) };
                        return Some(MatchRecord { components, record });
                    }
                }
                self.current = None;
            }

            if let Some(slots) = self.slots {
                if let Some(chunk) = self.chunks.next() {
                    self.current = Some((&**chunk, Q::bind(slots, chunk)));
                    self.row = 0;
                    self.end = chunk.size();
                    continue;
                }
            }

            let part = self.parts.next()?;
            self.slots = Some(part.slots);
            self.chunks = part.guard.chunks().iter();
        }
    }
}
