//! Application core: the fleet service and its port boundary.
//!
//! Everything the collector decides is decided in [`service`] through
//! the registry, link machines, presence detector and pipeline.  The
//! radio, the directory, delivery destinations and the chip are reached
//! only through the traits in [`ports`], so the whole core runs on the
//! host against mocks.

pub mod events;
pub mod ports;
pub mod service;
