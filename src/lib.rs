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

//! Tenant ECS - concurrent archetype storage
//!
//! Entities live in data compositions, one per exact component set. Each
//! composition rents id slots from a shared chunked pool, and every component
//! type is numbered by a lock-free class index.

pub mod bitset;
pub mod class_index;
pub mod component;
pub mod composition;
pub mod config;
pub mod entity;
pub mod error;
pub mod memory;
pub mod pool;
pub mod prelude;
pub mod query;
pub mod repository;
pub mod sort;
pub mod sparse;
pub mod stack;
pub mod world;

pub use class_index::ClassIndex;
pub use component::{Bundle, Component, ComponentInfo};
pub use composition::DataComposition;
pub use config::EngineConfig;
pub use entity::{Entity, IdSchema};
pub use error::{EcsError, Result};
pub use pool::{ChunkedPool, LinkedChunk, Tenant};
pub use query::{MatchRecord, QueryFetch, QueryFilter, Selection};
pub use repository::{CompositionRepository, Node, NodeCache};
pub use sort::IntArraySort;
pub use sparse::SparseIntMap;
pub use stack::{ConcurrentIntStack, ConcurrentLongStack};
pub use world::World;
