//! Typed stores over the persistence façade
//!
//! They return store-level errors unchanged; the engine and the scheduler add
//! the context of the operation that failed.

pub mod correlation_store;
pub mod entity_store;
pub mod scheduler_store;

pub use correlation_store::EventCorrelationStore;
pub use entity_store::EntityStore;
pub use scheduler_store::SchedulerStore;
