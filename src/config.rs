//! Fleet configuration parameters
//!
//! All tunable parameters for the collector.  Supplied once at startup;
//! persisted copies are encoded with `postcard` (see [`FleetConfig::to_bytes`]).

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::MAX_DEVICES;
use crate::sensor::{MAX_SENSORS, SensorType};

/// Longest allowlist entry accepted from persisted storage.  Only entries
/// that are exactly a device address long are loaded.
pub const STATIC_ID_CAPACITY: usize = 24;

// ═══════════════════════════════════════════════════════════════
// GATT profile
// ═══════════════════════════════════════════════════════════════

/// A Bluetooth UUID, either 16-bit SIG-assigned or full 128-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleUuid {
    /// Not configured.  Steps keyed on this UUID are skipped.
    None,
    U16(u16),
    /// Big-endian byte order, as written in the canonical string form.
    U128([u8; 16]),
}

impl BleUuid {
    pub const BATTERY_SERVICE: Self = Self::U16(0x180f);
    pub const BATTERY_LEVEL: Self = Self::U16(0x2a19);

    pub const fn from_u128(v: u128) -> Self {
        Self::U128(v.to_be_bytes())
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// UUIDs of the collector's peripheral profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattProfile {
    pub service: BleUuid,
    /// Notifying sensor-data characteristic.
    pub data: BleUuid,
    /// Remote configuration record and command characteristic.
    pub config: BleUuid,
    pub version: BleUuid,
    /// Advertised by presence-only tags.
    pub presence: BleUuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: BleUuid::from_u128(0xe54b_1d11_67f4_479e_8711_b3b9_9191_ce6c),
            data: BleUuid::from_u128(0xe54b_1d12_67f4_479e_8711_b3b9_9191_ce6c),
            config: BleUuid::from_u128(0xe54b_1d13_67f4_479e_8711_b3b9_9191_ce6c),
            version: BleUuid::from_u128(0xe54b_1d14_67f4_479e_8711_b3b9_9191_ce6c),
            presence: BleUuid::None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Fleet configuration
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    // --- Capacity ---
    /// Device slots in use (at most [`MAX_DEVICES`]).
    pub max_devices: u8,
    /// Sensors per device (at most [`MAX_SENSORS`]).
    pub max_sensors: u8,
    /// Simultaneous transport links the radio sustains.
    pub max_links: u8,

    // --- Device population ---
    pub static_devices: Vec<String<STATIC_ID_CAPACITY>, MAX_DEVICES>,
    /// Sensor type given to every static device.
    pub static_sensor_type: SensorType,
    /// Admit advertisers that are not on the static list.
    pub allow_dynamic_devices: bool,
    /// Ask the directory to create unknown static devices.
    pub create_static_devices: bool,
    /// Take over the sensor layout a peripheral already stores.
    pub adopt_remote_config: bool,

    // --- Presence ---
    pub arrive_delay_ms: u32,
    pub depart_delay_ms: u32,
    /// Re-affirm `Present` after this long without an event.
    pub presence_refresh_ms: u32,
    pub presence_sweep_ms: u32,

    // --- Connection ---
    pub backoff_unit_ms: u32,
    /// Retries tolerated before backoff applies.
    pub retry_threshold: u8,
    pub connect_watchdog_ms: u32,
    pub lock_timeout_ms: u32,

    // --- Telemetry ---
    pub force_update_ms: u32,
    pub queue_depth: u8,
    pub notify_queue_depth: u8,

    // --- Housekeeping ---
    /// Non-presence devices silent this long are pruned.
    pub device_timeout_ms: u32,
    pub housekeeping_interval_ms: u32,
    /// Health counter value that triggers a device reset.
    pub error_reset_threshold: u16,
    pub scan_fail_threshold: u8,

    // --- Peripheral firmware ---
    /// Newest peripheral firmware available; older peripherals are sent
    /// into DFU during configuration.
    pub dfu_min_version: Option<u16>,
    /// Restrict DFU to one hardware revision.
    pub dfu_hw_rev: Option<u16>,

    pub gatt: GattProfile,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            // Capacity
            max_devices: 4,
            max_sensors: MAX_SENSORS as u8,
            max_links: 4,

            // Population
            static_devices: Vec::new(),
            static_sensor_type: SensorType::Presence,
            allow_dynamic_devices: true,
            create_static_devices: false,
            adopt_remote_config: true,

            // Presence
            arrive_delay_ms: 0,
            depart_delay_ms: 90_000,
            presence_refresh_ms: 120_000,
            presence_sweep_ms: 10_000,

            // Connection
            backoff_unit_ms: 1_000,
            retry_threshold: 3,
            connect_watchdog_ms: 9_000,
            lock_timeout_ms: 6_000,

            // Telemetry
            force_update_ms: 120_000,
            queue_depth: 6,
            notify_queue_depth: 6,

            // Housekeeping
            device_timeout_ms: 200_000,
            housekeeping_interval_ms: 40_000,
            error_reset_threshold: 12,
            scan_fail_threshold: 3,

            dfu_min_version: None,
            dfu_hw_rev: None,

            gatt: GattProfile::default(),
        }
    }
}

impl FleetConfig {
    /// Reject settings the fixed-capacity tables cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 || self.max_devices as usize > MAX_DEVICES {
            return Err(Error::Config("max_devices out of range"));
        }
        if self.max_sensors == 0 || self.max_sensors as usize > MAX_SENSORS {
            return Err(Error::Config("max_sensors out of range"));
        }
        if self.max_links == 0 {
            return Err(Error::Config("max_links must be nonzero"));
        }
        if self.static_devices.len() > self.max_devices as usize {
            return Err(Error::Config("more static devices than device slots"));
        }
        if self.static_sensor_type == SensorType::None && !self.static_devices.is_empty() {
            return Err(Error::Config("static devices need a sensor type"));
        }
        if self.queue_depth == 0 || self.queue_depth as usize > crate::telemetry::MAX_QUEUE_DEPTH {
            return Err(Error::Config("queue_depth out of range"));
        }
        if self.notify_queue_depth == 0
            || self.notify_queue_depth as usize > crate::runtime::channels::NOTIFY_DEPTH
        {
            return Err(Error::Config("notify_queue_depth out of range"));
        }
        if self.presence_sweep_ms == 0 || self.housekeeping_interval_ms == 0 {
            return Err(Error::Config("periodic intervals must be nonzero"));
        }
        Ok(())
    }

    /// Encode for persisted storage.
    pub fn to_bytes(&self) -> Result<std::vec::Vec<u8>> {
        postcard::to_allocvec(self).map_err(|_| Error::Config("encode failed"))
    }

    /// Decode and validate a persisted copy.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let cfg: Self = postcard::from_bytes(bytes).map_err(|_| Error::Config("decode failed"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub const fn max_sensors(&self) -> usize {
        self.max_sensors as usize
    }

    pub const fn max_devices(&self) -> usize {
        self.max_devices as usize
    }
}
