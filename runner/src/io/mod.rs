//! I/O seams: host, engines, overlay, events, processes and files.

pub mod command;
pub mod config;
pub mod engine;
pub mod events;
pub mod expression;
pub mod host;
pub mod log_sink;
pub mod output;
pub mod overlay;
pub mod process;
