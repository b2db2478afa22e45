//! Conduit orchestrator
//!
//! Creates pipelines from Lua definitions, drives their jobs through the
//! status machine, hands builds to runners and keeps traces and artifacts.
//! The binary in `main.rs` wires these modules into an HTTP server and an
//! in-process background worker.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod repository;
pub mod service;
pub mod storage;
pub mod worker;
