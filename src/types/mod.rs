//! Shared types
//!
//! Configuration and boundary status codes.

pub mod config;
pub mod status;

pub use config::{ConfigError, ConfigUpdate, EngineConfig, KvCacheKind, IMAGE_MIN_TOKENS, MAX_COUNT};
pub use status::{status_of, StatusCode};
