//! sensorhub collector library.
//!
//! Exposes the domain modules for integration testing and host-side
//! simulation.  All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod arbiter;
pub mod config;
pub mod error;
pub mod link;
pub mod presence;
pub mod registry;
pub mod runtime;
pub mod scan;
pub mod sensor;
pub mod telemetry;
