//! Inbound transport events and outbound hub events.
//!
//! The BLE adapter owns no business logic: it turns radio callbacks into
//! [`TransportEvent`]s and [`Notification`]s and posts them to the
//! channels in [`crate::runtime::channels`].  The
//! [`FleetService`](super::service::FleetService) emits [`HubEvent`]s
//! through the [`EventSink`](super::ports::EventSink) port.

use heapless::Vec;

use crate::config::BleUuid;
use crate::link::StateId;
use crate::registry::{DeviceId, LinkHandle};
use crate::sensor::Presence;

pub const MAX_ADV_UUIDS: usize = 4;

/// Longest notification value accepted (index + type + 4-byte value).
pub const MAX_NOTIFY_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub addr: [u8; 6],
    pub uuids: Vec<BleUuid, MAX_ADV_UUIDS>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Advertised(Advertisement),
    /// The scan window ended without a stop request.
    ScanComplete,
    Authenticated { handle: LinkHandle, ok: bool },
    Disconnected { handle: LinkHandle },
}

/// Which subscription a notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifySource {
    /// Collector data characteristic: `[index, type, value…]`.
    Data,
    /// Standard battery level: one byte, percent.
    Battery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub handle: LinkHandle,
    pub source: NotifySource,
    pub bytes: Vec<u8, MAX_NOTIFY_LEN>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Delivery/transport health counter over threshold.
    HealthCounter,
    /// Too many consecutive scan start failures.
    ScanFailures,
}

/// Structured events emitted by the fleet core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    Started { devices: usize },
    DeviceCreated { slot: usize, id: DeviceId },
    DevicePruned { slot: usize, id: DeviceId },
    LinkChanged { slot: usize, from: StateId, to: StateId },
    PresenceChanged { slot: usize, presence: Presence },
    ResetRequested(ResetReason),
}
