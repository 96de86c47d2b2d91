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

//! Counting sort for small dense key domains and the archetype key hash

use crate::bitset::BitSet;
use crate::error::{EcsError, Result};

/// Counting sort over `0..capacity`.
///
/// Marks one bit per value and reads the bits back in ascending order.
pub struct IntArraySort;

impl IntArraySort {
    /// Sort `values` in place.
    ///
    /// Fails with [`EcsError::ValueOutOfRange`] for a value `>= capacity` and
    /// with [`EcsError::DuplicateValue`] when a value repeats.
    pub fn sort(values: &mut [u32], capacity: usize) -> Result<()> {
        let mut marks = BitSet::with_capacity(capacity);
        Self::sort_with(values, &mut marks)
    }

    /// Sort reusing a caller-provided bit set; the set is cleared first.
    pub fn sort_with(values: &mut [u32], marks: &mut BitSet) -> Result<()> {
        marks.clear();
        for &value in values.iter() {
            if value as usize >= marks.capacity() {
                return Err(EcsError::ValueOutOfRange {
                    value,
                    capacity: marks.capacity(),
                });
            }
            if !marks.insert(value as usize) {
                return Err(EcsError::DuplicateValue(value));
            }
        }
        for (slot, value) in values.iter_mut().zip(marks.ones()) {
            *slot = value as u32;
        }
        Ok(())
    }
}

/// Polynomial hash (`31 * h + index`) over already sorted indices.
pub fn sorted_hash(sorted: &[u32]) -> u64 {
    sorted
        .iter()
        .fold(0u64, |h, &index| h.wrapping_mul(31).wrapping_add(index as u64))
}
