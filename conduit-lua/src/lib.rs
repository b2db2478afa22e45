//! Conduit pipeline definitions
//!
//! This crate turns `.conduit.lua` pipeline definitions into
//! [`PipelineDefinition`] values. It includes:
//! - A restricted Lua sandbox with the `pipeline` helper module
//! - The definition parser
//! - Structural validation (stages, `needs` graph, retry bounds)

pub mod parser;
pub mod sandbox;
pub mod validate;

pub use parser::parse_pipeline_definition;
pub use sandbox::create_sandbox;
pub use validate::{ValidationError, validate_definition};

pub use conduit_core::domain::definition::{JobDefinition, PipelineDefinition};
