//! Connection arbiter: one exclusive lock per device slot.
//!
//! The radio can only run one secure handshake at a time, so taking a
//! lock also requires every *other* lock to be free.  A lock is assigned
//! once to a slot's [`Connection`](crate::registry::Connection) and kept
//! for the life of the process.
//!
//! The table lives behind an `embassy-sync` blocking mutex so the scan,
//! connection and dispatch tasks can share one `&'static Arbiter`.

use core::cell::RefCell;
use std::time::{Duration, Instant};

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, warn};

use crate::registry::MAX_DEVICES;

/// Poll interval for the timed waits.
const POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(u8);

impl LockId {
    pub const fn new(bit: u8) -> Self {
        Self(bit)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LockSlot {
    assigned: bool,
    held: bool,
}

struct Locks {
    slots: [LockSlot; MAX_DEVICES],
}

impl Locks {
    fn other_held(&self, id: LockId) -> bool {
        self.slots
            .iter()
            .enumerate()
            .any(|(i, l)| i != id.index() && l.held)
    }
}

pub struct Arbiter {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Locks>>,
}

impl Arbiter {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Locks {
                slots: [LockSlot {
                    assigned: false,
                    held: false,
                }; MAX_DEVICES],
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Locks) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    /// Hand out the next unassigned lock.
    pub fn assign(&self) -> Option<LockId> {
        self.with(|locks| {
            let (i, slot) = locks
                .slots
                .iter_mut()
                .enumerate()
                .find(|(_, l)| !l.assigned)?;
            slot.assigned = true;
            Some(LockId(i as u8))
        })
    }

    /// Non-blocking take.  Succeeds if `id` is already held (re-entrant
    /// for its owner) or if no other lock is held.
    pub fn try_take(&self, id: LockId) -> bool {
        self.with(|locks| {
            let Some(slot) = locks.slots.get(id.index()).copied() else {
                return false;
            };
            if !slot.assigned {
                return false;
            }
            if slot.held {
                return true;
            }
            if locks.other_held(id) {
                return false;
            }
            locks.slots[id.index()].held = true;
            true
        })
    }

    /// Release `id`.  Releasing a free lock is a no-op that reports success.
    pub fn give(&self, id: LockId) -> bool {
        self.with(|locks| {
            if let Some(slot) = locks.slots.get_mut(id.index()) {
                if slot.held {
                    debug!("arbiter: give {}", id.0);
                }
                slot.held = false;
            }
            true
        })
    }

    pub fn status(&self, id: LockId) -> bool {
        self.with(|locks| locks.slots.get(id.index()).is_some_and(|l| l.held))
    }

    pub fn all_free(&self) -> bool {
        self.with(|locks| locks.slots.iter().all(|l| !l.held))
    }

    pub fn held_count(&self) -> usize {
        self.with(|locks| locks.slots.iter().filter(|l| l.held).count())
    }

    /// Take `id`, waiting up to `timeout` for other holders to release.
    pub async fn take(&self, id: LockId, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.try_take(id) {
                debug!("arbiter: take {}", id.0);
                return true;
            }
            if start.elapsed() >= timeout {
                warn!("arbiter: lock {} not available after {:?}", id.0, timeout);
                return false;
            }
            Timer::after(POLL).await;
        }
    }

    /// Wait until no lock is held.
    pub async fn wait_all_free(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while !self.all_free() {
            if start.elapsed() >= timeout {
                return false;
            }
            Timer::after(POLL).await;
        }
        true
    }
}

impl Default for Arbiter {
    fn default() -> Self {
        Self::new()
    }
}
