//! Versioned response cache and the strategies that read through it.
//!
//! - Responses live in named generations (`shell-v4`, `dynamic-v4`, ...)
//! - Only successful responses are ever stored
//! - Strategies decide per request whether the cache or the network wins

mod generation;
mod layer;
mod storage;
mod traits;

pub use generation::{CacheNames, GenerationKind};
pub use layer::{CacheLayer, StrategyError};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheSource, Served};
