//! Ferrite - synthetic monitoring agent.
//!
//! Schedules HTTP, API, and browser probes, measures per-phase timings,
//! and fans the resulting metrics and events out to pluggable storage
//! backends.

pub mod config;
pub mod error;
pub mod internal_metrics;
pub mod job;
pub mod probe;
pub mod storage;
pub mod telemetry;
