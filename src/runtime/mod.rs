//! Task runtime: static channels, the executor that drives the
//! [`FleetService`](crate::app::service::FleetService), and the
//! delivery threads.

pub mod channels;
pub mod delivery;
pub mod task_pin;
pub mod tasks;

pub use tasks::run;
