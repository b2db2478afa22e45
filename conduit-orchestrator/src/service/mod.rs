//! Service Module
//!
//! Business logic layer for the orchestrator. Services take a
//! [`context::ServiceContext`] and resolve to a `ServiceResult`; the HTTP
//! handlers and the background worker are thin callers.

pub mod artifacts;
pub mod auth;
pub mod build_state;
pub mod cancel;
pub mod context;
pub mod downstream;
pub mod lease;
pub mod locking;
pub mod pipeline;
pub mod processing;
pub mod project;
pub mod rate_limit;
pub mod register_job;
pub mod retry;
pub mod runner;
pub mod stuck;
pub mod trace;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::ServiceContext;
