//! Domain entities and the typed stores that persist them

pub mod entities;
pub mod repositories;
