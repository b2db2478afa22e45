//! Scheduler layer for the runner
//!
//! Polls the orchestrator for jobs and drives each one from assignment to
//! its final state.

pub mod job;
pub mod poller;

pub use poller::JobPoller;
