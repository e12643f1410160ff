//! Blood donation pipeline - acquire, clean, load, then build datamarts

pub mod clean;
pub mod datamart;
pub mod error;
pub mod fetch;
pub mod frame;
pub mod orchestrator;
pub mod parse;
pub mod queries;
pub mod store;
pub mod types;
pub mod utils;
pub mod warehouse;

pub use error::{PipelineError, Result};
pub use orchestrator::{Pipeline, RunPlan};
pub use types::*;
