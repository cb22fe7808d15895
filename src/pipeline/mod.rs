//! The governance pipeline: adapter seams, shared types, and the
//! self-healing orchestrator that drives generate -> validate -> execute.

pub mod adapters;
pub mod diff;
pub mod orchestrator;
pub mod types;

pub use adapters::{ExecutionAdapter, GenerationAdapter};
pub use orchestrator::{Orchestrator, PipelineLimits, QueryRequest, MAX_REPAIRS};
