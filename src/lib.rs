//! Faultline: an incident execution and resilience engine.
//!
//! Turns cluster fault notifications into supervised investigation jobs:
//! each accepted fault event becomes a persisted incident, gets an isolated
//! workspace, and drives one investigator subprocess under a hard deadline.
//! The subprocess outcome is validated against an output contract, the
//! incident record is settled in the state store, and a circuit breaker
//! watches for runs of consecutive failures.

pub mod breaker;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod executor;
pub mod incident;
pub mod notify;
pub mod orchestrator;
pub mod workspace;

pub use error::Error;
