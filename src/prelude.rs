//! Convenient re-exports of commonly used types.
//!
//! The prelude can be imported with:
//! ```
//! use tenant_ecs::prelude::*;
//! ```

pub use crate::component::{Bundle, Component};
pub use crate::config::EngineConfig;
pub use crate::entity::Entity;
pub use crate::error::{EcsError, Result};
pub use crate::query::{MatchRecord, Selection};
pub use crate::world::World;
