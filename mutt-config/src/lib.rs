//! Process configuration (`StaticConfig`, loaded once at startup) and the
//! dynamic-config subsystem (`DynConfig`, live-reloadable via the queue
//! substrate's KV store and pub/sub).

pub mod dynconfig;
pub mod static_config;

pub use dynconfig::{DynConfig, DynConfigError, CONFIG_UPDATES_CHANNEL, RECOGNIZED_DEFAULTS};
pub use static_config::{RotatingSecret, StaticConfig};
