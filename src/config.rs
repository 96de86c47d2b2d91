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

//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::class_index::{ClassIndex, MAX_HASH_BITS, MIN_HASH_BITS};
use crate::entity::{IdSchema, MAX_CHUNK_BIT, MIN_CHUNK_BIT};
use crate::error::{EcsError, Result};

pub const DEFAULT_CHUNK_BIT: u32 = 14;
pub const DEFAULT_CLASS_INDEX_BIT: u32 = 12;
pub const DEFAULT_CLASS_INDEX_MAX_BIT: u32 = 24;
pub const DEFAULT_SYSTEM_TIMEOUT_MS: u64 = 3_000;

/// Storage engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Object-id bits; each chunk holds `2^chunk_bit` entities
    pub chunk_bit: u32,
    /// Optional cap below the id layout's own chunk limit
    pub max_chunks: Option<usize>,
    /// Initial class index table width
    pub class_index_bit: u32,
    /// Width at which class index regrowth gives up
    pub class_index_max_bit: u32,
    /// Execution timeout handed to an external scheduler, in milliseconds
    pub system_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_bit: DEFAULT_CHUNK_BIT,
            max_chunks: None,
            class_index_bit: DEFAULT_CLASS_INDEX_BIT,
            class_index_max_bit: DEFAULT_CLASS_INDEX_MAX_BIT,
            system_timeout_ms: DEFAULT_SYSTEM_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    pub fn with_chunk_bit(mut self, chunk_bit: u32) -> Self {
        self.chunk_bit = chunk_bit;
        self
    }

    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = Some(max_chunks);
        self
    }

    pub fn with_class_index_bits(mut self, bits: u32, max_bits: u32) -> Self {
        self.class_index_bit = bits;
        self.class_index_max_bit = max_bits;
        self
    }

    /// Sub-millisecond precision is dropped
    pub fn with_system_timeout(mut self, timeout: Duration) -> Self {
        self.system_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn system_timeout(&self) -> Duration {
        Duration::from_millis(self.system_timeout_ms)
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_BIT..=MAX_CHUNK_BIT).contains(&self.chunk_bit) {
            return Err(EcsError::InvalidConfig(format!(
                "chunk_bit {} outside {MIN_CHUNK_BIT}..={MAX_CHUNK_BIT}",
                self.chunk_bit
            )));
        }
        if self.max_chunks == Some(0) {
            return Err(EcsError::InvalidConfig("max_chunks must be at least 1".to_string()));
        }
        if !(MIN_HASH_BITS..=MAX_HASH_BITS).contains(&self.class_index_bit) {
            return Err(EcsError::InvalidConfig(format!(
                "class_index_bit {} outside {MIN_HASH_BITS}..={MAX_HASH_BITS}",
                self.class_index_bit
            )));
        }
        if !(self.class_index_bit..=MAX_HASH_BITS).contains(&self.class_index_max_bit) {
            return Err(EcsError::InvalidConfig(format!(
                "class_index_max_bit {} outside {}..={MAX_HASH_BITS}",
                self.class_index_max_bit, self.class_index_bit
            )));
        }
        Ok(())
    }

    /// Parse and validate; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn id_schema(&self) -> Result<IdSchema> {
        IdSchema::new(self.chunk_bit, self.max_chunks)
    }

    pub fn class_index(&self) -> Result<ClassIndex> {
        ClassIndex::new(self.class_index_bit, self.class_index_max_bit)
    }
}
