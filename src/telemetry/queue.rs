//! Per-destination delivery queues and the global health counter.
//!
//! ```text
//!  producer ──push──▶ ┌──────────────────────┐ ──pop──▶ consumer task
//!                     │ Deque<DeliveryRecord> │            │
//!            requeue_front (once per record) ◀─── fail ────┘
//! ```
//!
//! Both ends share one queue through `&'static`; the deque sits behind an
//! `embassy-sync` blocking mutex and the consumer parks on a `Signal`.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use heapless::Deque;
use log::{error, info, warn};

use super::DeliveryRecord;
use crate::app::ports::DeliveryPort;
use crate::error::CapacityError;
use crate::sensor::Scopes;

pub const MAX_QUEUE_DEPTH: usize = 8;

// ═══════════════════════════════════════════════════════════════
// Health counter
// ═══════════════════════════════════════════════════════════════

/// Global delivery/transport health.  Every failed attempt adds, every
/// clean pass decays by one.  Crossing the threshold asks for a reset.
pub struct HealthMonitor {
    errors: AtomicU16,
    threshold: u16,
}

impl HealthMonitor {
    pub const fn new(threshold: u16) -> Self {
        Self {
            errors: AtomicU16::new(0),
            threshold,
        }
    }

    /// Returns `true` when the counter has crossed the reset threshold.
    pub fn record(&self, failures: u8) -> bool {
        let step = |prev: u16| {
            if failures > 0 {
                prev.saturating_add(u16::from(failures))
            } else {
                prev.saturating_sub(1)
            }
        };
        // Producers and every delivery thread share the counter.
        let prev = self
            .errors
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| Some(step(prev)))
            .unwrap_or_else(|prev| prev);
        let next = step(prev);
        if next > self.threshold {
            error!("health: error count {next} over threshold {}", self.threshold);
            return true;
        }
        false
    }

    pub fn errors(&self) -> u16 {
        self.errors.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════
// Delivery queue
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// First failure: back at the head for one more try.
    Requeued,
    /// Second consecutive failure: discarded.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Serviced {
    pub outcome: DeliveryOutcome,
    /// The health counter crossed its threshold on this pass.
    pub reset: bool,
}

pub struct DeliveryQueue {
    scope: Scopes,
    depth: usize,
    records: Mutex<CriticalSectionRawMutex, RefCell<Deque<DeliveryRecord, MAX_QUEUE_DEPTH>>>,
    ready: Signal<CriticalSectionRawMutex, ()>,
    dropped: AtomicU32,
}

impl DeliveryQueue {
    pub fn new(scope: Scopes, depth: usize) -> Self {
        Self {
            scope,
            depth: depth.clamp(1, MAX_QUEUE_DEPTH),
            records: Mutex::new(RefCell::new(Deque::new())),
            ready: Signal::new(),
            dropped: AtomicU32::new(0),
        }
    }

    pub const fn scope(&self) -> Scopes {
        self.scope
    }

    fn with<R>(&self, f: impl FnOnce(&mut Deque<DeliveryRecord, MAX_QUEUE_DEPTH>) -> R) -> R {
        self.records.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn push(&self, record: DeliveryRecord) -> Result<(), CapacityError> {
        let depth = self.depth;
        self.with(|q| {
            if q.len() >= depth {
                return Err(CapacityError::QueueFull);
            }
            q.push_back(record).map_err(|_| CapacityError::QueueFull)
        })?;
        self.ready.signal(());
        Ok(())
    }

    pub fn pop(&self) -> Option<DeliveryRecord> {
        self.with(Deque::pop_front)
    }

    /// Put a record back at the head.  Ignores the configured depth so a
    /// retry is never lost to a producer that filled the queue meanwhile.
    pub fn requeue_front(&self, record: DeliveryRecord) -> bool {
        let ok = self.with(|q| q.push_front(record).is_ok());
        if ok {
            self.ready.signal(());
        }
        ok
    }

    pub fn len(&self) -> usize {
        self.with(|q| q.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages dropped after their retry, net of later successes.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Park until a producer pushes.
    pub async fn wait(&self) {
        self.ready.wait().await;
    }

    /// Deliver the head record through `sink`.  `None` when empty.
    pub fn service(&self, sink: &mut dyn DeliveryPort, health: &HealthMonitor) -> Option<Serviced> {
        let mut record = self.pop()?;

        let outcome = match sink.send(self.scope, &record) {
            Ok(()) => {
                let _ = self
                    .dropped
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
                DeliveryOutcome::Delivered
            }
            Err(e) if record.retried => {
                error!("delivery {:?}: {e}, giving up on {}", self.scope, record.endpoint);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Dropped
            }
            Err(e) => {
                warn!("delivery {:?}: {e}, will try once more", self.scope);
                record.retried = true;
                if self.requeue_front(record) {
                    DeliveryOutcome::Requeued
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    DeliveryOutcome::Dropped
                }
            }
        };

        let failures = u8::from(outcome != DeliveryOutcome::Delivered);
        let reset = health.record(failures);
        if outcome == DeliveryOutcome::Delivered {
            info!("delivery {:?}: ok", self.scope);
        }
        Some(Serviced { outcome, reset })
    }
}
