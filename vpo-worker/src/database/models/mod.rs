//! Database models.
//!
//! These map directly onto the schema in `migrations/`.

pub mod job;

pub use job::*;
