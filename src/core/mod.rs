// Core Module - Foundational types, config, logging, events

pub mod types;
pub mod config;
pub mod logger;
pub mod events;

// Re-export commonly used items for convenience
pub use types::*;
pub use config::{
    BinanceConfig, CacheConfig, MonitoringConfig, RateLimitTierConfig,
    ConfigManager, ConfigSummary, ConfigError,
};
pub use logger::{setup_logging, setup_logging_from_config};
pub use events::{ListenerId, OutOfSync, OutOfSyncReason, Subscribers, SubscriberStats};
