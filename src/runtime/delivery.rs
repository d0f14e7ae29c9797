//! Delivery consumers, one thread per destination.
//!
//! ```text
//!  collector thread                 deliver-influx thread
//!  ┌───────────────┐  push   ┌──────────────┐  service  ┌──────────┐
//!  │ FleetService  │───────▶│ DeliveryQueue │─────────▶│ HttpSink │ (blocks)
//!  │  (executor)   │        └──────────────┘           └──────────┘
//!  │               │◀── RESET_REQUEST ── health over threshold
//!  └───────────────┘
//! ```
//!
//! A destination send may block for its whole HTTP timeout.  Only the
//! thread draining that destination waits; the collector executor keeps
//! ticking links and watchdogs.  Queues and the health counter are
//! `'static` behind critical-section mutexes, so they cross threads as is.

use core::time::Duration;
use std::io;
use std::thread::JoinHandle;

use async_io_mini::Timer;
use futures_lite::future;
use log::info;

use super::channels::RESET_REQUEST;
use super::task_pin::{Core, spawn_on_core};
use crate::app::events::ResetReason;
use crate::app::ports::DeliveryPort;
use crate::telemetry::{DeliveryOutcome, DeliveryQueue, HealthMonitor};

/// A consumer wakes at least this often even without a push.
const IDLE_MS: u64 = 1_000;

/// Pause before the single retry of a failed record.
const RETRY_MS: u64 = 500;

const PRIORITY: u8 = 4;
const STACK_KB: usize = 8;

/// Start draining `queue` into `port` on a thread of its own.  `name` must
/// be NUL-terminated.
pub fn spawn<P>(
    name: &'static str,
    queue: &'static DeliveryQueue,
    health: &'static HealthMonitor,
    port: P,
) -> io::Result<JoinHandle<()>>
where
    P: DeliveryPort + Send + 'static,
{
    spawn_on_core(Core::App, PRIORITY, STACK_KB, name, move || {
        info!("delivery {:?}: consumer running", queue.scope());
        future::block_on(drain(queue, health, port));
    })
}

async fn drain<P: DeliveryPort>(queue: &DeliveryQueue, health: &HealthMonitor, mut port: P) {
    loop {
        future::or(queue.wait(), async {
            Timer::after(Duration::from_millis(IDLE_MS)).await;
        })
        .await;

        while let Some(serviced) = queue.service(&mut port, health) {
            if serviced.reset {
                RESET_REQUEST.signal(ResetReason::HealthCounter);
            }
            if serviced.outcome == DeliveryOutcome::Requeued {
                Timer::after(Duration::from_millis(RETRY_MS)).await;
            }
        }
    }
}
