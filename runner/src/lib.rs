//! Execution core for "run a script as one step of a workflow" jobs.
//!
//! For a single step invocation the pipeline decides whether to skip it,
//! no-op it or run it; runs the script body under a timeout with cooperative
//! cancellation; and reconciles the step's inputs with the script's output
//! into the property set the next step sees. The architecture keeps a strict
//! split:
//!
//! - **[`core`]**: Pure, deterministic logic (parameters, conditions,
//!   reconciliation, shared task slots). No I/O.
//! - **[`io`]**: Side-effecting seams (host, script engines, configuration
//!   overlay, child processes, files). Isolated behind traits for tests.
//!
//! Orchestration modules ([`gate`], [`executor`], [`job`]) compose the two.

pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod job;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::core::error::JobError;
pub use crate::core::params::ParameterSet;
pub use crate::core::types::{JobPhase, OutputPropertySet, StepRef};
pub use crate::job::{JobLifecycleController, JobOutcome};
