//! Shared mutable context threaded through every link-state handler.
//!
//! `LinkContext` is the blackboard for one device's handshake: it
//! borrows the registry, the arbiter and the transport ports for the
//! duration of a single tick, plus the per-link [`LinkScratch`] that
//! survives between ticks.

use log::warn;

use crate::app::ports::{BleCentral, DirectoryPort};
use crate::arbiter::{Arbiter, LockId};
use crate::config::FleetConfig;
use crate::error::Error;
use crate::registry::{Connection, DeviceId, DeviceSlot, LinkHandle, Registry};

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

/// One-shot deadline reused across connection attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnTimer {
    deadline: Option<u64>,
}

impl ConnTimer {
    /// Start or restart the timer.  A zero timeout cannot be armed.
    pub fn arm(&mut self, now_ms: u64, timeout_ms: u32) -> bool {
        if timeout_ms == 0 {
            self.deadline = None;
            return false;
        }
        self.deadline = Some(now_ms.saturating_add(u64::from(timeout_ms)));
        true
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        self.deadline.is_some_and(|d| now_ms >= d)
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

// ---------------------------------------------------------------------------
// Per-link scratch state
// ---------------------------------------------------------------------------

/// Position inside the configuration exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigStep {
    #[default]
    Probe,
    SubscribeBattery,
    ReadVersion,
    Negotiate,
    Subscribe,
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkScratch {
    pub timer: ConnTimer,
    pub step: ConfigStep,
    /// Set by the connection manager once it holds the slot's lock.
    pub requested: bool,
    /// Why the current attempt is being closed.  `None` closes cleanly.
    pub failure: Option<Error>,
}

// ---------------------------------------------------------------------------
// LinkContext
// ---------------------------------------------------------------------------

pub struct LinkContext<'a> {
    pub now_ms: u64,
    pub slot: usize,
    pub config: &'a FleetConfig,
    pub registry: &'a mut Registry,
    pub arbiter: &'a Arbiter,
    pub central: &'a mut dyn BleCentral,
    pub directory: &'a mut dyn DirectoryPort,
    pub scratch: &'a mut LinkScratch,
}

impl LinkContext<'_> {
    pub fn device(&self) -> Option<&DeviceSlot> {
        self.registry.slot(self.slot)
    }

    pub fn device_mut(&mut self) -> Option<&mut DeviceSlot> {
        self.registry.slot_mut(self.slot)
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.device().and_then(|d| d.id.clone())
    }

    pub fn connection(&self) -> Option<Connection> {
        self.device().and_then(|d| d.connection)
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.device_mut().and_then(|d| d.connection.as_mut())
    }

    pub fn lock(&self) -> Option<LockId> {
        self.connection().map(|c| c.lock)
    }

    pub fn handle(&self) -> Option<LinkHandle> {
        self.connection().and_then(|c| c.handle)
    }

    pub fn lock_held(&self) -> bool {
        self.lock().is_some_and(|l| self.arbiter.status(l))
    }

    /// Record why this attempt fails.  The first reason wins.
    pub fn fail(&mut self, err: Error) {
        if self.scratch.failure.is_none() {
            warn!("link {}: {err}", self.slot);
            self.scratch.failure = Some(err);
        }
    }
}
