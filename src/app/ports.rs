//! Port traits: the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ FleetService (domain)
//! ```
//!
//! Driven adapters (BLE central, device directory, delivery sinks, reset)
//! implement these traits.  The [`FleetService`](super::service::FleetService)
//! takes them as `&mut dyn` / `&mut impl` parameters, so the domain core
//! never touches the radio or the network directly.
//!
//! All port errors are typed; callers handle every variant.

use core::fmt;

use heapless::Vec;

use crate::config::BleUuid;
use crate::error::{DeliveryError, TransportError};
use crate::registry::{DeviceId, LinkHandle};
use crate::sensor::{MAX_SENSORS, Scopes, SensorType};
use crate::telemetry::DeliveryRecord;

use super::events::{HubEvent, NotifySource, ResetReason};

/// Largest characteristic value the collector reads.
pub const MAX_ATTR_LEN: usize = 20;

// ───────────────────────────────────────────────────────────────
// BLE central (driven adapter: domain → radio)
// ───────────────────────────────────────────────────────────────

/// GATT client operations.  Authentication results, disconnects and
/// advertisements come back as
/// [`TransportEvent`](super::events::TransportEvent)s, never as callbacks
/// into the domain.
pub trait BleCentral {
    fn scan_start(&mut self) -> Result<(), TransportError>;

    fn scan_stop(&mut self);

    /// Open a secure link.  Pairing continues in the background and is
    /// reported as `TransportEvent::Authenticated`.
    fn connect(&mut self, id: &DeviceId) -> Result<LinkHandle, TransportError>;

    fn has_service(&mut self, handle: LinkHandle, service: BleUuid) -> bool;

    fn read(
        &mut self,
        handle: LinkHandle,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Result<Vec<u8, MAX_ATTR_LEN>, TransportError>;

    fn write(
        &mut self,
        handle: LinkHandle,
        service: BleUuid,
        characteristic: BleUuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Enable notifications.  Values arrive on the notification channel
    /// tagged with `source`.
    fn subscribe(
        &mut self,
        handle: LinkHandle,
        service: BleUuid,
        characteristic: BleUuid,
        source: NotifySource,
    ) -> Result<(), TransportError>;

    fn disconnect(&mut self, handle: LinkHandle) -> Result<(), TransportError>;
}

// ───────────────────────────────────────────────────────────────
// Device directory (driven adapter: domain ↔ remote device registry)
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLookup {
    /// The directory knows this device and its sensor layout.
    Found(Vec<SensorType, MAX_SENSORS>),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryError {
    Unavailable,
    /// Any answer other than found / not found.
    Status(u16),
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "directory unavailable"),
            Self::Status(code) => write!(f, "directory returned status {code}"),
        }
    }
}

pub trait DirectoryPort {
    /// Directory negotiation runs only when this returns `true`.
    fn enabled(&self) -> bool {
        true
    }

    fn get_config(&mut self, id: &DeviceId) -> Result<ConfigLookup, DirectoryError>;

    /// Register a brand-new device.
    fn init_device(&mut self, id: &DeviceId) -> bool;

    /// Register a preconfigured device with its sensor type.
    fn create_device(&mut self, id: &DeviceId, kind: SensorType) -> bool;
}

/// Directory for standalone collectors: negotiation is skipped.
pub struct NoDirectory;

impl DirectoryPort for NoDirectory {
    fn enabled(&self) -> bool {
        false
    }

    fn get_config(&mut self, _id: &DeviceId) -> Result<ConfigLookup, DirectoryError> {
        Ok(ConfigLookup::NotFound)
    }

    fn init_device(&mut self, _id: &DeviceId) -> bool {
        false
    }

    fn create_device(&mut self, _id: &DeviceId, _kind: SensorType) -> bool {
        false
    }
}

// ───────────────────────────────────────────────────────────────
// Delivery destination (driven adapter: domain → network)
// ───────────────────────────────────────────────────────────────

/// Sends one serialised record.  No retry logic lives here; the
/// delivery queue owns that.
pub trait DeliveryPort {
    fn send(&mut self, scope: Scopes, record: &DeliveryRecord) -> Result<(), DeliveryError>;
}

// ───────────────────────────────────────────────────────────────
// Reset (driven adapter: domain → chip)
// ───────────────────────────────────────────────────────────────

/// Coarse last-resort recovery.
pub trait ResetPort {
    fn reset(&mut self, reason: ResetReason);
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`HubEvent`]s through this port.
pub trait EventSink {
    fn emit(&mut self, event: &HubEvent);
}
