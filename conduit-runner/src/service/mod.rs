//! Service layer
//!
//! Script execution, trace buffering and artifact bundling. Execution is
//! trait-based so the scheduler can be driven with another executor.

pub mod artifacts;
mod execution;
mod trace;

pub use execution::{ExecutionService, ScriptOutcome, ShellExecutionService};
pub use trace::TraceBuffer;
