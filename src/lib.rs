//! Event correlation and job scheduling core of a BPM engine
//!
//! Waiting events and message instances are matched into couples, timers
//! and background jobs are fired by a persistent scheduler, and every unit
//! of work runs in a transaction retried on optimistic-lock conflicts.

pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod service_registry;

// Re-export commonly used types
pub use config::AppConfiguration;
pub use error::{AppError, Result};
pub use service_registry::{Collaborators, ServiceRegistry, ServiceStatus};
