//! Device registry: a fixed arena of device slots.
//!
//! Slots are recycled in place and never freed.  A slot keeps its
//! index and its [`Connection`] (and with it the arbiter lock) across
//! deletions, so the arbiter never sees a lock reassigned underneath it.
//!
//! ```text
//!  slot │ in_use │ id                │ sensors      │ connection
//!  ─────┼────────┼───────────────────┼──────────────┼────────────────
//!    0  │  yes   │ c4:7c:8d:6a:1f:02 │ PRESENCE, -- │ lock 0, Success
//!    1  │  no    │ -                 │ --, --       │ lock 1, None
//!    2  │  no    │ -                 │ --, --       │ (never created)
//! ```

use core::fmt;

use heapless::String;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::arbiter::{Arbiter, LockId};
use crate::config::FleetConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::presence::PresenceState;
use crate::sensor::{MAX_SENSORS, Presence, Sensor, SensorType};

/// Compile-time ceiling on device slots.
pub const MAX_DEVICES: usize = 8;

/// `aa:bb:cc:dd:ee:ff`
pub const DEVICE_ID_LEN: usize = 17;

// ═══════════════════════════════════════════════════════════════
// Identity
// ═══════════════════════════════════════════════════════════════

/// Stable wire address of a peripheral, lowercase colon-separated hex.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String<DEVICE_ID_LEN>);

impl DeviceId {
    pub fn parse(s: &str) -> core::result::Result<Self, ProtocolError> {
        let addr = parse_addr(s).ok_or(ProtocolError::InvalidDeviceId)?;
        Ok(Self::from_addr(addr))
    }

    pub fn from_addr(addr: [u8; 6]) -> Self {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::new();
        for (i, b) in addr.iter().enumerate() {
            if i > 0 {
                let _ = out.push(':');
            }
            let _ = out.push(HEX[(b >> 4) as usize] as char);
            let _ = out.push(HEX[(b & 0x0f) as usize] as char);
        }
        Self(out)
    }

    pub fn to_addr(&self) -> [u8; 6] {
        // Constructed only through `from_addr`, so always well formed.
        parse_addr(&self.0).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn parse_addr(s: &str) -> Option<[u8; 6]> {
    if s.len() != DEVICE_ID_LEN {
        return None;
    }
    let mut addr = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut addr {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(addr)
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════
// Connection
// ═══════════════════════════════════════════════════════════════

/// Transport-assigned handle of an open link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    None,
    Pending,
    Success,
    Failed,
}

/// Link bookkeeping owned by a slot.  Created once per slot, on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub auth: AuthState,
    /// Assigned once, kept for the life of the slot.
    pub lock: LockId,
    pub retry_count: u8,
    pub last_attempt: Option<u64>,
    /// Present only while `auth != None`.
    pub handle: Option<LinkHandle>,
}

impl Connection {
    pub const fn new(lock: LockId) -> Self {
        Self {
            auth: AuthState::None,
            lock,
            retry_count: 0,
            last_attempt: None,
            handle: None,
        }
    }

    /// Linear backoff gate.  Below `threshold` retries every attempt is
    /// allowed; at or above it, `retry_count * unit_ms` must have passed
    /// since the last failed attempt.
    pub fn may_attempt(&self, now_ms: u64, threshold: u8, unit_ms: u32) -> bool {
        let Some(last) = self.last_attempt else {
            return true;
        };
        if self.retry_count == 0 || self.retry_count < threshold {
            return true;
        }
        now_ms.saturating_sub(last) > u64::from(self.retry_count) * u64::from(unit_ms)
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_attempt = Some(now_ms);
    }

    pub fn record_success(&mut self) {
        self.retry_count = 0;
        self.last_attempt = None;
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════
// Device slot
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct DeviceSlot {
    pub in_use: bool,
    pub id: Option<DeviceId>,
    pub sensors: [Sensor; MAX_SENSORS],
    pub connection: Option<Connection>,
    pub last_seen: u64,
    pub firmware_version: u16,
    pub hardware_revision: u16,
    slot_index: usize,
}

impl DeviceSlot {
    const fn empty(slot_index: usize) -> Self {
        Self {
            in_use: false,
            id: None,
            sensors: [Sensor::EMPTY; MAX_SENSORS],
            connection: None,
            last_seen: 0,
            firmware_version: 0,
            hardware_revision: 0,
            slot_index,
        }
    }

    pub const fn slot_index(&self) -> usize {
        self.slot_index
    }

    /// Clear the record, keeping the slot index and the connection.
    fn recycle(&mut self) {
        let connection = self.connection.map(|mut c| {
            c.auth = AuthState::None;
            c.handle = None;
            c.record_success();
            c
        });
        *self = Self::empty(self.slot_index);
        self.connection = connection;
    }

    pub fn primary_sensor(&self) -> SensorType {
        self.sensors[0].kind
    }

    /// Store the packed version word: high half hardware revision,
    /// low half firmware version.
    pub fn set_version_word(&mut self, word: u32) {
        self.hardware_revision = (word >> 16) as u16;
        self.firmware_version = (word & 0xffff) as u16;
    }

    /// True when `available` is newer than the running firmware and,
    /// with `for_hw_rev` set, the hardware revision matches.
    pub fn update_needed(&self, available: u16, for_hw_rev: Option<u16>) -> bool {
        if for_hw_rev.is_some_and(|hw| hw != self.hardware_revision) {
            return false;
        }
        available > self.firmware_version
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some_and(|c| c.is_open())
    }
}

/// One line of the periodic device table report.
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub slot: usize,
    pub id: DeviceId,
    pub connected: bool,
    pub firmware_version: u16,
    pub hardware_revision: u16,
    pub primary: SensorType,
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} v{} hw{} {}",
            self.slot,
            self.id,
            if self.connected { "*" } else { " " },
            self.firmware_version,
            self.hardware_revision,
            self.primary.name()
        )
    }
}

// ═══════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════

pub struct Registry {
    slots: [DeviceSlot; MAX_DEVICES],
    presence: [PresenceState; MAX_DEVICES],
    capacity: usize,
    max_sensors: usize,
}

impl Registry {
    pub fn new(capacity: usize, max_sensors: usize) -> Self {
        Self {
            slots: core::array::from_fn(DeviceSlot::empty),
            presence: [PresenceState::default(); MAX_DEVICES],
            capacity: capacity.min(MAX_DEVICES),
            max_sensors: max_sensors.min(MAX_SENSORS),
        }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(config.max_devices(), config.max_sensors())
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn max_sensors(&self) -> usize {
        self.max_sensors
    }

    // ── lookup ─────────────────────────────────────────────────

    pub fn lookup_index(&self, id: &DeviceId) -> Option<usize> {
        self.active()
            .position(|s| s.in_use && s.id.as_ref() == Some(id))
    }

    pub fn lookup(&self, id: &DeviceId) -> Option<&DeviceSlot> {
        self.lookup_index(id).map(|i| &self.slots[i])
    }

    pub fn lookup_mut(&mut self, id: &DeviceId) -> Option<&mut DeviceSlot> {
        self.lookup_index(id).map(|i| &mut self.slots[i])
    }

    pub fn find_by_handle(&self, handle: LinkHandle) -> Option<usize> {
        self.active().position(|s| {
            s.connection
                .is_some_and(|c| c.handle == Some(handle))
        })
    }

    pub fn slot(&self, index: usize) -> Option<&DeviceSlot> {
        self.active().nth(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut DeviceSlot> {
        self.slots[..self.capacity].get_mut(index)
    }

    /// Every slot position, in use or not.
    pub fn active(&self) -> impl Iterator<Item = &DeviceSlot> {
        self.slots[..self.capacity].iter()
    }

    pub fn in_use(&self) -> impl Iterator<Item = &DeviceSlot> {
        self.active().filter(|s| s.in_use)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use().count()
    }

    pub fn presence(&self, index: usize) -> Option<&PresenceState> {
        self.presence[..self.capacity].get(index)
    }

    pub fn presence_mut(&mut self, index: usize) -> Option<&mut PresenceState> {
        self.presence[..self.capacity].get_mut(index)
    }

    // ── lifecycle ──────────────────────────────────────────────

    /// Claim the first free slot for `id`.  An already registered id
    /// returns its existing slot untouched.  `None` means no capacity.
    pub fn create(&mut self, id: &DeviceId, now_ms: u64, arbiter: &Arbiter) -> Option<&mut DeviceSlot> {
        if let Some(i) = self.lookup_index(id) {
            debug!("registry: {id} already in slot {i}");
            return Some(&mut self.slots[i]);
        }

        let Some(index) = self.active().position(|s| !s.in_use) else {
            warn!("registry: no free slot for {id}");
            return None;
        };

        let connection = match self.slots[index].connection {
            Some(c) => c,
            None => {
                let Some(lock) = arbiter.assign() else {
                    warn!("registry: no arbiter lock left for slot {index}");
                    return None;
                };
                Connection::new(lock)
            }
        };

        let slot = &mut self.slots[index];
        slot.recycle();
        slot.id = Some(id.clone());
        slot.in_use = true;
        slot.last_seen = now_ms;
        slot.connection = Some(connection);

        self.presence[index] = PresenceState::with_presence(Presence::NotPresent);
        info!("registry: created {id} in slot {index}");
        Some(&mut self.slots[index])
    }

    /// Recycle a slot.  Fails while its link is still open; the caller
    /// must close it first.
    pub fn delete(&mut self, index: usize) -> Result<()> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(Error::Protocol(ProtocolError::UnknownDevice))?;
        if slot.is_connected() {
            warn!("registry: slot {index} still has an open link");
            return Err(Error::LinkOpen);
        }
        if let Some(id) = &slot.id {
            info!("registry: deleted {id} from slot {index}");
        }
        slot.recycle();
        self.presence[index] = PresenceState::default();
        Ok(())
    }

    /// First sensor position already of `kind`, else the first free one.
    pub fn add_sensor(&mut self, index: usize, kind: SensorType) -> Option<&mut Sensor> {
        if kind == SensorType::None {
            return None;
        }
        let max_sensors = self.max_sensors;
        let slot = self.slot_mut(index)?;
        for i in 0..max_sensors {
            let sensor = slot.sensors[i];
            if !sensor.in_use {
                if kind == SensorType::Presence {
                    slot.last_seen = 0;
                }
                slot.sensors[i] = Sensor::assigned(kind, i as u8);
                return Some(&mut slot.sensors[i]);
            }
            if sensor.kind == kind {
                return Some(&mut slot.sensors[i]);
            }
        }
        warn!("registry: no sensor slot for {} on slot {index}", kind.name());
        None
    }

    /// Create every allowlisted device of the right length and give it
    /// `static_sensor_type`.  Returns how many were loaded.
    pub fn load_static(&mut self, config: &FleetConfig, now_ms: u64, arbiter: &Arbiter) -> usize {
        let mut loaded = 0;
        for raw in &config.static_devices {
            let Ok(id) = DeviceId::parse(raw) else {
                warn!("registry: skipping malformed static id {raw:?}");
                continue;
            };
            let Some(slot) = self.create(&id, now_ms, arbiter) else {
                break;
            };
            let index = slot.slot_index();
            if self.add_sensor(index, config.static_sensor_type).is_some() {
                loaded += 1;
            }
        }
        loaded
    }

    pub fn report(&self) -> impl Iterator<Item = DeviceReport> + '_ {
        self.in_use().filter_map(|s| {
            Some(DeviceReport {
                slot: s.slot_index,
                id: s.id.clone()?,
                connected: s.is_connected(),
                firmware_version: s.firmware_version,
                hardware_revision: s.hardware_revision,
                primary: s.primary_sensor(),
            })
        })
    }

    /// First slot silent for longer than `timeout_ms`.  Presence devices
    /// and devices never heard from are exempt.
    pub fn prune_candidate(&self, now_ms: u64, timeout_ms: u32) -> Option<usize> {
        self.in_use()
            .find(|s| {
                s.last_seen != 0
                    && s.primary_sensor() != SensorType::Presence
                    && now_ms > s.last_seen.saturating_add(u64::from(timeout_ms))
            })
            .map(DeviceSlot::slot_index)
    }
}
