//! Grading worker.
//!
//! - [`Worker`]: keeps a judge stream open to the broker and reconnects on failure
//! - [`Grader`]: compiles once, runs every case concurrently, aggregates the verdict
//! - [`diff`]: whitespace-insensitive answer comparison

pub mod client;
pub mod diff;
pub mod grader;

pub use client::Worker;
pub use grader::Grader;
