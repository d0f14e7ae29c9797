//! Presence detector.
//!
//! Debounces raw link events into a stable present / not-present signal.
//!
//! ```text
//!   authenticated ──▶ arrived ──[arrive_delay]──▶ emit Present
//!   disconnected  ──▶ departed ─[depart_delay]──▶ emit NotPresent
//!   Present, idle ──[refresh]──▶ emit Present again
//! ```
//!
//! A pending flag is cleared once its emission has been handed to the
//! event destination, or when the presence hook returns `true`.  Until
//! then every sweep re-emits.

use heapless::Vec;
use log::{debug, info};

use crate::config::FleetConfig;
use crate::registry::{DeviceId, MAX_DEVICES, Registry};
use crate::sensor::{Presence, SensorType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    None,
    Arrived,
    Departed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresenceState {
    pub arrived: bool,
    pub departed: bool,
    pub event_ts: u64,
    pub presence: Presence,
}

impl PresenceState {
    pub const fn with_presence(presence: Presence) -> Self {
        Self {
            arrived: false,
            departed: false,
            event_ts: 0,
            presence,
        }
    }

    /// Replace any pending action.  `None` only clears.
    pub fn set_action(&mut self, action: PresenceAction, now_ms: u64) {
        self.arrived = action == PresenceAction::Arrived;
        self.departed = action == PresenceAction::Departed;
        self.event_ts = now_ms;
    }

    pub fn pending(&self) -> bool {
        self.arrived || self.departed
    }
}

/// Called after every emission.  Returning `true` settles the pending action.
pub type PresenceHook = fn(usize, &PresenceState) -> bool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEmission {
    pub slot: usize,
    pub id: DeviceId,
    pub presence: Presence,
}

pub struct PresenceDetector {
    arrive_delay_ms: u64,
    depart_delay_ms: u64,
    refresh_ms: u64,
    hook: Option<PresenceHook>,
}

impl PresenceDetector {
    pub fn new(config: &FleetConfig) -> Self {
        Self {
            arrive_delay_ms: u64::from(config.arrive_delay_ms),
            depart_delay_ms: u64::from(config.depart_delay_ms),
            refresh_ms: u64::from(config.presence_refresh_ms),
            hook: None,
        }
    }

    pub fn set_hook(&mut self, hook: PresenceHook) {
        self.hook = Some(hook);
    }

    /// Devices whose primary sensor is Presence or Force take part.
    pub fn participates(registry: &Registry, slot: usize) -> bool {
        registry.slot(slot).is_some_and(|s| {
            s.in_use && matches!(s.primary_sensor(), SensorType::Presence | SensorType::Force)
        })
    }

    fn set_action(registry: &mut Registry, slot: usize, action: PresenceAction, now_ms: u64) {
        if !Self::participates(registry, slot) {
            return;
        }
        if let Some(state) = registry.presence_mut(slot) {
            debug!("presence: slot {slot} -> {action:?}");
            state.set_action(action, now_ms);
        }
    }

    pub fn on_authenticated(&self, registry: &mut Registry, slot: usize, now_ms: u64) {
        Self::set_action(registry, slot, PresenceAction::Arrived, now_ms);
    }

    pub fn on_disconnected(&self, registry: &mut Registry, slot: usize, now_ms: u64) {
        Self::set_action(registry, slot, PresenceAction::Departed, now_ms);
    }

    /// Seed every participating device from its current link state.
    pub fn prime(&self, registry: &mut Registry, now_ms: u64) {
        for slot in 0..registry.capacity() {
            let Some(connected) = registry.slot(slot).map(|s| s.is_connected()) else {
                continue;
            };
            let action = if connected {
                PresenceAction::Arrived
            } else {
                PresenceAction::Departed
            };
            Self::set_action(registry, slot, action, now_ms);
        }
    }

    /// Examine every participating slot and collect due emissions.
    /// The new presence value is recorded immediately.
    pub fn sweep(&self, registry: &mut Registry, now_ms: u64) -> Vec<PresenceEmission, MAX_DEVICES> {
        let mut out = Vec::new();
        for slot in 0..registry.capacity() {
            if !Self::participates(registry, slot) {
                continue;
            }
            let Some(id) = registry.slot(slot).and_then(|s| s.id.clone()) else {
                continue;
            };
            let Some(state) = registry.presence_mut(slot) else {
                continue;
            };
            let elapsed = now_ms.saturating_sub(state.event_ts);

            let due = if state.arrived {
                (elapsed >= self.arrive_delay_ms).then_some(Presence::Present)
            } else if state.departed {
                (elapsed >= self.depart_delay_ms).then_some(Presence::NotPresent)
            } else if state.presence == Presence::Present && elapsed > self.refresh_ms {
                state.event_ts = now_ms;
                Some(Presence::Present)
            } else {
                None
            };

            if let Some(presence) = due {
                if state.presence != presence {
                    info!("presence: {id} {}", presence.as_str());
                }
                state.presence = presence;
                let _ = out.push(PresenceEmission { slot, id, presence });
            }
        }
        out
    }

    /// Close out one emission.  `handed_off` is true when the event
    /// destination accepted the update.
    pub fn settle(&self, registry: &mut Registry, slot: usize, handed_off: bool, now_ms: u64) {
        let Some(state) = registry.presence(slot).copied() else {
            return;
        };
        let hook_settled = self.hook.is_some_and(|hook| hook(slot, &state));
        if handed_off || hook_settled {
            Self::set_action(registry, slot, PresenceAction::None, now_ms);
        }
    }
}
