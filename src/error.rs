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

//! Error types

use std::fmt;

/// ECS error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// The same component type appears twice in one entity's component set
    DuplicateComponentType(&'static str),

    /// Component type is not part of the composition or entity
    ComponentNotFound(&'static str),

    /// Entity handle is stale, destroyed or was never issued
    EntityNotFound,

    /// Every chunk id of the pool has been handed out
    ChunkCapacityExhausted { max_chunks: usize },

    /// Raw memory allocation failed
    AllocationFailed { bytes: usize },

    /// Two distinct types still collide at the maximum class index width
    ClassIndexCollision { hash_bits: u32, first: &'static str, second: &'static str },

    /// Two distinct component sets produced the same archetype key
    ArchetypeHashCollision { key: u64 },

    /// Counting sort met the same value twice
    DuplicateValue(u32),

    /// Counting sort met a value outside its declared domain
    ValueOutOfRange { value: u32, capacity: usize },

    /// Configuration rejected during validation or parsing
    InvalidConfig(String),
}

impl EcsError {
    /// Fatal errors leave the engine unable to grow; there is no retry policy for them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EcsError::ChunkCapacityExhausted { .. }
                | EcsError::AllocationFailed { .. }
                | EcsError::ClassIndexCollision { .. }
                | EcsError::ArchetypeHashCollision { .. }
        )
    }
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::DuplicateComponentType(name) => {
                write!(f, "Duplicate component type: {name}")
            }
            EcsError::ComponentNotFound(name) => write!(f, "Component not found: {name}"),
            EcsError::EntityNotFound => write!(f, "Entity not found"),
            EcsError::ChunkCapacityExhausted { max_chunks } => {
                write!(f, "Chunk capacity exhausted: all {max_chunks} chunks are in use")
            }
            EcsError::AllocationFailed { bytes } => {
                write!(f, "Failed to allocate {bytes} bytes")
            }
            EcsError::ClassIndexCollision { hash_bits, first, second } => write!(
                f,
                "Class index collision between {first} and {second} at maximum width of {hash_bits} bits"
            ),
            EcsError::ArchetypeHashCollision { key } => {
                write!(f, "Archetype key {key:#x} maps to two different component sets")
            }
            EcsError::DuplicateValue(value) => write!(f, "Duplicate value: {value}"),
            EcsError::ValueOutOfRange { value, capacity } => {
                write!(f, "Value {value} is outside the sort capacity {capacity}")
            }
            EcsError::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

impl From<std::alloc::LayoutError> for EcsError {
    fn from(err: std::alloc::LayoutError) -> Self {
        EcsError::InvalidConfig(format!("Invalid memory layout: {err}"))
    }
}

impl From<serde_json::Error> for EcsError {
    fn from(err: serde_json::Error) -> Self {
        EcsError::InvalidConfig(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
