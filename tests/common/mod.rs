#![allow(dead_code)]

// Shared fixtures and mock collaborators for the integration tests
pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
