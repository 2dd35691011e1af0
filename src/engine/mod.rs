//! Engine module - compile-then-run execution
//!
//! - `executer`: runs one step against an isolation handle under a wall-clock limit
//! - `pipeline`: owns the request's workspace and handle, sequences the steps,
//!   and guarantees teardown

pub mod executer;
pub mod pipeline;

pub use pipeline::{Pipeline, PipelineSettings};
