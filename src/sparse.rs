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

//! Sparse-set map for small non-negative integer keys

use crate::sort::{sorted_hash, IntArraySort};

const ABSENT: u32 = u32::MAX;

/// Map from small `u32` keys to values.
///
/// Values live densely in insertion order; the sparse array maps a key to its
/// dense position. `clone` is a deep, independent copy.
#[derive(Debug, Clone)]
pub struct SparseIntMap<V> {
    sparse: Vec<u32>,
    keys: Vec<u32>,
    values: Vec<V>,
}

impl<V> Default for SparseIntMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SparseIntMap<V> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Pre-size for keys `0..key_capacity`
    pub fn with_capacity(key_capacity: usize) -> Self {
        Self {
            sparse: vec![ABSENT; key_capacity],
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    #[inline]
    fn position(&self, key: u32) -> Option<usize> {
        match self.sparse.get(key as usize) {
            Some(&pos) if pos != ABSENT => Some(pos as usize),
            _ => None,
        }
    }

    /// Insert or replace, returning the previous value
    pub fn put(&mut self, key: u32, value: V) -> Option<V> {
        if let Some(pos) = self.position(key) {
            return Some(std::mem::replace(&mut self.values[pos], value));
        }
        let idx = key as usize;
        if idx >= self.sparse.len() {
            self.sparse.resize(idx + 1, ABSENT);
        }
        self.sparse[idx] = self.keys.len() as u32;
        self.keys.push(key);
        self.values.push(value);
        None
    }

    pub fn get(&self, key: u32) -> Option<&V> {
        self.position(key).map(|pos| &self.values[pos])
    }

    pub fn get_mut(&mut self, key: u32) -> Option<&mut V> {
        self.position(key).map(move |pos| &mut self.values[pos])
    }

    pub fn contains_key(&self, key: u32) -> bool {
        self.position(key).is_some()
    }

    /// Remove a key; the last dense entry takes its place
    pub fn remove(&mut self, key: u32) -> Option<V> {
        let pos = self.position(key)?;
        self.sparse[key as usize] = ABSENT;
        self.keys.swap_remove(pos);
        let value = self.values.swap_remove(pos);
        if let Some(&moved) = self.keys.get(pos) {
            self.sparse[moved as usize] = pos as u32;
        }
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[u32] {
        &self.keys
    }

    pub fn values(&self) -> &[V] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> {
        self.keys.iter().copied().zip(self.values.iter())
    }

    /// Keys in ascending order
    pub fn sorted_keys(&self) -> Vec<u32> {
        let mut keys = self.keys.clone();
        // Keys are unique and bounded by the sparse array, so this cannot fail.
        if IntArraySort::sort(&mut keys, self.sparse.len()).is_err() {
            keys.sort_unstable();
        }
        keys
    }

    /// Hash of the key set, independent of insertion order
    pub fn sorted_keys_hash_code(&self) -> u64 {
        sorted_hash(&self.sorted_keys())
    }
}
