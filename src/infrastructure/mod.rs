//! Storage backends

pub mod persistence;
