//! Core domain types
//!
//! This module contains the core domain structures used across Conduit services.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (for persistence and scheduling) and runners (for execution).

pub mod artifact;
pub mod dag;
pub mod definition;
pub mod job;
pub mod pipeline;
pub mod project;
pub mod runner;
pub mod status;
pub mod trace;
