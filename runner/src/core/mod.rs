//! Deterministic, pure logic shared by the step pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod condition;
pub mod error;
pub mod keys;
pub mod params;
pub mod reconcile;
pub mod task;
pub mod types;
