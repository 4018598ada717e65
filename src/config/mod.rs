//! Configuration for the correlation and scheduling core
//!
//! Defaults are overlaid by an optional YAML file and then by environment
//! variables, in that order.

pub mod app_config;

pub use app_config::{
    AppConfiguration, CorrelationConfig, LoggingConfig, RetryConfig, SchedulerConfig, StoreBackend,
    StoreConfig,
};
