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

//! Concurrent component type registry
//!
//! Every component type gets a small positive index the first time it is
//! seen. Indices are dense (1, 2, 3, ...) and never change, which lets the
//! rest of the engine key flat arrays by them.
//!
//! Lookups probe an open-addressed table of `2^hash_bits` slots with the top
//! bits of the type's hash. Readers never lock: the table is published through
//! an epoch-managed atomic pointer. Writers serialize on a mutex, re-check the
//! slot, and either claim it or rebuild a wider table when two types collide.

use std::any::TypeId;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use ahash::RandomState;
use crossbeam::epoch::{self, Atomic, Owned};
use parking_lot::Mutex;
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::debug;

use crate::component::ComponentInfo;
use crate::error::{EcsError, Result};
use crate::memory::RawBuffer;
use crate::sort::{sorted_hash, IntArraySort};

/// Smallest accepted table width
pub const MIN_HASH_BITS: u32 = 1;

/// Widest table the index will ever build
pub const MAX_HASH_BITS: u32 = 30;

// Fixed seeds keep slot assignment identical across runs.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

struct ClassEntry {
    type_id: TypeId,
    name: &'static str,
    hash: u64,
    index: u32,
}

struct Table {
    hash_bits: u32,
    slots: RawBuffer<AtomicPtr<ClassEntry>>,
}

impl Table {
    fn new(hash_bits: u32) -> Result<Self> {
        Ok(Self {
            hash_bits,
            slots: RawBuffer::zeroed(1usize << hash_bits)?,
        })
    }

    #[inline]
    fn slot(&self, hash: u64) -> &AtomicPtr<ClassEntry> {
        &self.slots[(hash >> (64 - self.hash_bits)) as usize]
    }
}

/// Concurrent `TypeId` -> index map.
///
/// Index 0 is never assigned and stands for "unknown type".
pub struct ClassIndex {
    table: Atomic<Table>,
    entries: Mutex<Vec<Box<ClassEntry>>>,
    size: AtomicU32,
    max_hash_bits: u32,
    hasher: RandomState,
}

impl ClassIndex {
    /// Create an index with `2^hash_bits` slots, growable up to `2^max_hash_bits`
    pub fn new(hash_bits: u32, max_hash_bits: u32) -> Result<Self> {
        if !(MIN_HASH_BITS..=MAX_HASH_BITS).contains(&hash_bits)
            || !(hash_bits..=MAX_HASH_BITS).contains(&max_hash_bits)
        {
            return Err(EcsError::InvalidConfig(format!(
                "class index bits {hash_bits}..={max_hash_bits} outside {MIN_HASH_BITS}..={MAX_HASH_BITS}"
            )));
        }
        let (k0, k1, k2, k3) = HASH_SEEDS;
        Ok(Self {
            table: Atomic::new(Table::new(hash_bits)?),
            entries: Mutex::new(Vec::new()),
            size: AtomicU32::new(0),
            max_hash_bits,
            hasher: RandomState::with_seeds(k0, k1, k2, k3),
        })
    }

    #[inline]
    fn hash_of(&self, type_id: TypeId) -> u64 {
        self.hasher.hash_one(type_id)
    }

    /// Index of `type_id`, `None` when it was never registered
    pub fn get_index(&self, type_id: TypeId) -> Option<u32> {
        let hash = self.hash_of(type_id);
        let guard = epoch::pin();
        // SAFETY: the table pointer is never null and retired tables are only
        // reclaimed after every pinned reader has moved on.
        let table = unsafe { self.table.load(Ordering::Acquire, &guard).deref() };
        let entry = table.slot(hash).load(Ordering::Acquire);
        if entry.is_null() {
            return None;
        }
        // SAFETY: entries are boxed and owned by `self.entries` until drop.
        let entry = unsafe { &*entry };
        (entry.type_id == type_id).then_some(entry.index)
    }

    /// Index of `info`, registering it when unknown
    pub fn get_index_or_add_class(&self, info: &ComponentInfo) -> Result<u32> {
        match self.get_index(info.type_id()) {
            Some(index) => Ok(index),
            None => self.add_class(info),
        }
    }

    /// Register `info`; returns the existing index when already present
    pub fn add_class(&self, info: &ComponentInfo) -> Result<u32> {
        let mut entries = self.entries.lock();
        if let Some(index) = self.get_index(info.type_id()) {
            return Ok(index);
        }

        let hash = self.hash_of(info.type_id());
        let entry = Box::new(ClassEntry {
            type_id: info.type_id(),
            name: info.name(),
            hash,
            index: entries.len() as u32 + 1,
        });

        let guard = epoch::pin();
        let current = self.table.load(Ordering::Acquire, &guard);
        // SAFETY: writers hold the entries lock, so `current` stays installed.
        let table = unsafe { current.deref() };
        let slot = table.slot(hash);
        let wider = if slot.load(Ordering::Acquire).is_null() {
            None
        } else {
            Some(self.rebuild(table.hash_bits, &entries, &entry)?)
        };

        // A reader that finds the new index must also see it counted in `size`.
        let index = entry.index;
        self.size.store(index, Ordering::Release);
        match wider {
            None => slot.store(&*entry as *const ClassEntry as *mut ClassEntry, Ordering::Release),
            Some(wider) => {
                let old = self.table.swap(Owned::new(wider), Ordering::AcqRel, &guard);
                // SAFETY: `old` is unreachable for new readers once swapped out.
                unsafe { guard.defer_destroy(old) };
            }
        }
        entries.push(entry);
        Ok(index)
    }

    /// Build the narrowest wider table in which every entry owns its slot
    fn rebuild(&self, from_bits: u32, entries: &[Box<ClassEntry>], new: &ClassEntry) -> Result<Table> {
        let mut bits = from_bits;
        loop {
            if bits >= self.max_hash_bits {
                let first = entries
                    .iter()
                    .find(|e| e.hash >> (64 - bits) == new.hash >> (64 - bits))
                    .map(|e| e.name)
                    .unwrap_or("<unknown>");
                return Err(EcsError::ClassIndexCollision {
                    hash_bits: self.max_hash_bits,
                    first,
                    second: new.name,
                });
            }
            bits += 1;
            let table = Table::new(bits)?;
            let placed = entries
                .iter()
                .map(|e| &**e)
                .chain(std::iter::once(new))
                .all(|e| {
                    let slot = table.slot(e.hash);
                    if slot.load(Ordering::Relaxed).is_null() {
                        slot.store(e as *const ClassEntry as *mut ClassEntry, Ordering::Relaxed);
                        true
                    } else {
                        false
                    }
                });
            if placed {
                #[cfg(feature = "profiling")]
                debug!(
                    from_bits,
                    to_bits = bits,
                    classes = entries.len() + 1,
                    "class index regrown"
                );
                return Ok(table);
            }
        }
    }

    /// Batch lookup, `None` for unknown types
    pub fn get_indices(&self, type_ids: &[TypeId]) -> SmallVec<[Option<u32>; 8]> {
        type_ids.iter().map(|&t| self.get_index(t)).collect()
    }

    /// Batch lookup registering unknown types
    pub fn get_index_or_add_classes(&self, infos: &[ComponentInfo]) -> Result<SmallVec<[u32; 8]>> {
        infos.iter().map(|info| self.get_index_or_add_class(info)).collect()
    }

    /// Order-independent hash of a component set.
    ///
    /// Resolves every type, sorts the indices and folds them with `31 * h + i`.
    /// A type listed twice is [`EcsError::DuplicateComponentType`].
    pub fn long_hash_code(&self, infos: &[ComponentInfo]) -> Result<u64> {
        let mut indices = self.get_index_or_add_classes(infos)?;
        let capacity = self.size() as usize + 1;
        IntArraySort::sort(&mut indices, capacity).map_err(|err| match err {
            EcsError::DuplicateValue(index) => EcsError::DuplicateComponentType(
                self.type_name(index).unwrap_or("<unknown>"),
            ),
            other => other,
        })?;
        Ok(sorted_hash(&indices))
    }

    /// Name of the type registered under `index`
    pub fn type_name(&self, index: u32) -> Option<&'static str> {
        let entries = self.entries.lock();
        entries.get((index as usize).checked_sub(1)?).map(|e| e.name)
    }

    /// Number of registered types, which is also the highest index issued
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Current table width
    pub fn hash_bits(&self) -> u32 {
        let guard = epoch::pin();
        // SAFETY: see `get_index`.
        unsafe { self.table.load(Ordering::Acquire, &guard).deref() }.hash_bits
    }

    pub fn max_hash_bits(&self) -> u32 {
        self.max_hash_bits
    }
}

impl Drop for ClassIndex {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent readers.
        unsafe {
            let table = self.table.swap(epoch::Shared::null(), Ordering::AcqRel, epoch::unprotected());
            if !table.is_null() {
                drop(table.into_owned());
            }
        }
    }
}
