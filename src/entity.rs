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

//! Entity identifiers and handles.
//!
//! An id is a `u32` laid out as `[detached:1 | reserved:1 | chunk-id | object-id]`.
//! The object-id width is the schema's chunk bit count; the chunk-id takes the
//! remaining 30 - b bits.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::composition::DataComposition;
use crate::error::{EcsError, Result};

/// Set once the entity has been destroyed
pub const DETACHED_BIT: u32 = 1 << 31;

/// Set while the entity moves between compositions
pub const RESERVED_BIT: u32 = 1 << 30;

pub const FLAG_MASK: u32 = DETACHED_BIT | RESERVED_BIT;

/// Bits available for chunk-id plus object-id
pub const ID_BITS: u32 = 30;

pub const ID_MASK: u32 = !FLAG_MASK;

pub const MIN_CHUNK_BIT: u32 = 2;
pub const MAX_CHUNK_BIT: u32 = 24;

/// Bit layout shared by every id a pool issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSchema {
    chunk_bit: u32,
    chunk_capacity: usize,
    max_chunks: usize,
    object_id_mask: u32,
}

impl IdSchema {
    /// Schema with `2^chunk_bit` slots per chunk.
    ///
    /// The chunk count is capped by the remaining id bits and, when given,
    /// by `max_chunks`.
    pub fn new(chunk_bit: u32, max_chunks: Option<usize>) -> Result<Self> {
        if !(MIN_CHUNK_BIT..=MAX_CHUNK_BIT).contains(&chunk_bit) {
            return Err(EcsError::InvalidConfig(format!(
                "chunk bit {chunk_bit} outside {MIN_CHUNK_BIT}..={MAX_CHUNK_BIT}"
            )));
        }
        let addressable = 1usize << (ID_BITS - chunk_bit);
        let max_chunks = match max_chunks {
            Some(0) => {
                return Err(EcsError::InvalidConfig(
                    "max chunks must be at least 1".to_string(),
                ))
            }
            Some(limit) => limit.min(addressable),
            None => addressable,
        };
        Ok(Self {
            chunk_bit,
            chunk_capacity: 1 << chunk_bit,
            max_chunks,
            object_id_mask: (1u32 << chunk_bit) - 1,
        })
    }

    #[inline]
    pub fn chunk_bit(&self) -> u32 {
        self.chunk_bit
    }

    /// Slots per chunk
    #[inline]
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    #[inline]
    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    /// Pack a chunk-id and an object-id; flags are clear
    #[inline]
    pub fn create_id(&self, chunk_id: usize, object_id: usize) -> u32 {
        debug_assert!(chunk_id < self.max_chunks, "chunk id {chunk_id} out of range");
        debug_assert!(object_id < self.chunk_capacity, "object id {object_id} out of range");
        ((chunk_id as u32) << self.chunk_bit) | (object_id as u32 & self.object_id_mask)
    }

    #[inline]
    pub fn fetch_chunk_id(&self, id: u32) -> usize {
        ((id & ID_MASK) >> self.chunk_bit) as usize
    }

    #[inline]
    pub fn fetch_object_id(&self, id: u32) -> usize {
        (id & self.object_id_mask) as usize
    }

    #[inline]
    pub fn is_detached(id: u32) -> bool {
        id & DETACHED_BIT != 0
    }

    #[inline]
    pub fn is_reserved(id: u32) -> bool {
        id & RESERVED_BIT != 0
    }

    #[inline]
    pub fn strip_flags(id: u32) -> u32 {
        id & ID_MASK
    }
}

/// Items stored in a pool slot carry their own id.
///
/// The pool rewrites the id whenever the item changes slot.
pub trait Identifiable: Send + Sync + 'static {
    fn id(&self) -> u32;

    fn set_id(&self, id: u32);

    /// Move to a new slot while keeping the flag bits
    fn relocate(&self, id: u32) {
        self.set_id(IdSchema::strip_flags(id) | (self.id() & FLAG_MASK));
    }
}

/// Shared state behind an [`Entity`] handle
pub struct EntityRecord {
    id: AtomicU32,
    composition: RwLock<Weak<DataComposition>>,
}

impl EntityRecord {
    pub(crate) fn new(composition: &Arc<DataComposition>) -> Self {
        Self {
            id: AtomicU32::new(0),
            composition: RwLock::new(Arc::downgrade(composition)),
        }
    }

    /// Composition currently holding the entity
    pub fn composition(&self) -> Option<Arc<DataComposition>> {
        self.composition.read().upgrade()
    }

    pub(crate) fn set_composition(&self, composition: &Arc<DataComposition>) {
        *self.composition.write() = Arc::downgrade(composition);
    }

    /// Flag `id` as in transit; fails if the id changed or carries a flag
    pub(crate) fn try_reserve(&self, id: u32) -> bool {
        id & FLAG_MASK == 0
            && self
                .id
                .compare_exchange(id, id | RESERVED_BIT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Flag `id` as destroyed; fails if the id changed or carries a flag
    pub(crate) fn try_detach(&self, id: u32) -> bool {
        id & FLAG_MASK == 0
            && self
                .id
                .compare_exchange(id, id | DETACHED_BIT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub(crate) fn detach(&self) {
        self.id.fetch_or(DETACHED_BIT, Ordering::AcqRel);
    }
}

impl Identifiable for EntityRecord {
    #[inline]
    fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    #[inline]
    fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    fn relocate(&self, id: u32) {
        let raw = IdSchema::strip_flags(id);
        // Reserve and detach race with this from outside the tenant lock.
        let _ = self
            .id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(raw | (current & FLAG_MASK))
            });
    }
}

impl fmt::Debug for EntityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRecord").field("id", &self.id()).finish()
    }
}

/// Handle to an entity.
///
/// Clones refer to the same entity; equality is identity.
#[derive(Clone)]
pub struct Entity(pub(crate) Arc<EntityRecord>);

impl Entity {
    pub(crate) fn from_record(record: Arc<EntityRecord>) -> Self {
        Self(record)
    }

    /// Current id, flag bits included
    pub fn id(&self) -> u32 {
        self.0.id()
    }

    /// False once destroyed or once its world is gone
    pub fn is_alive(&self) -> bool {
        !IdSchema::is_detached(self.id()) && self.0.composition.read().strong_count() > 0
    }

    pub fn composition(&self) -> Option<Arc<DataComposition>> {
        self.0.composition()
    }

    pub(crate) fn record(&self) -> &Arc<EntityRecord> {
        &self.0
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id();
        f.debug_struct("Entity")
            .field("id", &IdSchema::strip_flags(id))
            .field("detached", &IdSchema::is_detached(id))
            .field("reserved", &IdSchema::is_reserved(id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_round_trip_all_chunk_bits() {
        for chunk_bit in MIN_CHUNK_BIT..=MAX_CHUNK_BIT {
            let schema = IdSchema::new(chunk_bit, None).unwrap();
            let last_chunk = schema.max_chunks() - 1;
            let last_object = schema.chunk_capacity() - 1;
            for (chunk, object) in [(0, 0), (last_chunk, last_object), (last_chunk / 2, 1)] {
                let id = schema.create_id(chunk, object);
                assert_eq!(id & FLAG_MASK, 0);
                assert_eq!(schema.fetch_chunk_id(id), chunk);
                assert_eq!(schema.fetch_object_id(id), object);
            }
        }
    }

    #[test]
    fn test_flags_do_not_disturb_fields() {
        let schema = IdSchema::new(4, None).unwrap();
        let id = schema.create_id(9, 13);
        let flagged = id | DETACHED_BIT | RESERVED_BIT;
        assert_eq!(schema.fetch_chunk_id(flagged), 9);
        assert_eq!(schema.fetch_object_id(flagged), 13);
        assert!(IdSchema::is_detached(flagged));
        assert!(IdSchema::is_reserved(flagged));
        assert_eq!(IdSchema::strip_flags(flagged), id);
    }

    #[test]
    fn test_max_chunks_capped() {
        let schema = IdSchema::new(14, None).unwrap();
        assert_eq!(schema.max_chunks(), 1 << 16);
        assert_eq!(IdSchema::new(14, Some(100)).unwrap().max_chunks(), 100);
        assert_eq!(IdSchema::new(24, Some(1 << 20)).unwrap().max_chunks(), 64);
    }

    #[test]
    fn test_invalid_schema() {
        assert!(IdSchema::new(1, None).is_err());
        assert!(IdSchema::new(25, None).is_err());
        assert!(IdSchema::new(8, Some(0)).is_err());
    }

    #[test]
    fn test_record_flag_transitions() {
        let record = EntityRecord {
            id: AtomicU32::new(5),
            composition: RwLock::new(Weak::new()),
        };
        assert!(!record.try_reserve(4));
        assert!(record.try_reserve(5));
        assert!(!record.try_detach(5));
        record.relocate(7);
        assert_eq!(record.id(), 7 | RESERVED_BIT);
        record.set_id(7);
        assert_eq!(record.id(), 7);
        assert!(record.try_detach(7));
        assert!(!record.try_reserve(7 | DETACHED_BIT));
        assert_eq!(record.id(), 7 | DETACHED_BIT);
    }
}
