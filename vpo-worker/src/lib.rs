//! vpo-worker library crate.
//!
//! A durable SQLite-backed job queue and a single-job-at-a-time worker for
//! media transcode and move jobs.

pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod logging;
pub mod progress;
pub mod safety;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};
