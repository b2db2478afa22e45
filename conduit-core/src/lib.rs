//! Conduit Core
//!
//! Core types and abstractions for the Conduit CI/CD system.
//!
//! This crate contains:
//! - Domain types: Core business entities (Pipeline, Job, Runner, etc.),
//!   the job status machine and composite status rules
//! - DTOs: Data transfer objects for communication between the orchestrator,
//!   runners and the CLI

pub mod domain;
pub mod dto;

pub use domain::status::{JobEvent, Status, TransitionError, composite_status};
