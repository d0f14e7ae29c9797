//! Sensor taxonomy, per-sensor state and the on-air payload formats.
//!
//! ```text
//!   notification bytes            remote config record (u32 LE)
//!  ┌─────┬──────┬───────────┐    ┌────────┬────────┬────────┬────────┐
//!  │ idx │ type │ value BE  │    │ iface0 │ type0  │ iface1 │ type1  │
//!  └─────┴──────┴───────────┘    └────────┴────────┴────────┴────────┘
//!    0      1     2..N (1/2/4)      byte 0   byte 1   byte 2   byte 3
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Compile-time ceiling on sensors per device.
pub const MAX_SENSORS: usize = 2;

/// Readings above this are treated as sensor noise for `Light`.
const LIGHT_MAX: u16 = 0x0fff;

// ───────────────────────────────────────────────────────────────
// Sensor type table
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SensorType {
    Battery = 0,
    Light = 1,
    Motion = 2,
    Humidity = 3,
    Temperature = 4,
    Contact = 5,
    Identity = 6,
    Na7 = 7,
    UvLight = 8,
    Proximity = 9,
    Particles = 10,
    Gasses = 11,
    Force = 12,
    Presence = 13,
    Current = 14,
    /// Unassigned slot.  Also the wire value for "invalid".
    None = 255,
}

impl SensorType {
    /// Every assignable type, in id order.
    pub const ALL: [SensorType; 15] = [
        Self::Battery,
        Self::Light,
        Self::Motion,
        Self::Humidity,
        Self::Temperature,
        Self::Contact,
        Self::Identity,
        Self::Na7,
        Self::UvLight,
        Self::Proximity,
        Self::Particles,
        Self::Gasses,
        Self::Force,
        Self::Presence,
        Self::Current,
    ];

    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        if id == Self::None.id() {
            return Some(Self::None);
        }
        Self::ALL.get(id as usize).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Battery => "BATTERY",
            Self::Light => "LIGHT",
            Self::Motion => "MOTION",
            Self::Humidity => "HUMIDITY",
            Self::Temperature => "TEMPERATURE",
            Self::Contact => "CONTACT",
            Self::Identity => "IDENTITY",
            Self::Na7 => "NA7",
            Self::UvLight => "UV_LIGHT",
            Self::Proximity => "PROXIMITY",
            Self::Particles => "PARTICLES",
            Self::Gasses => "GASSES",
            Self::Force => "FORCE",
            Self::Presence => "PRESENCE",
            Self::Current => "CURRENT",
            Self::None => "INVALID",
        }
    }

    /// Case-insensitive lookup by [`name`](Self::name).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }

    pub const fn interface(self) -> Interface {
        match self {
            Self::Battery | Self::Light | Self::Humidity | Self::UvLight => Interface::ADC,
            Self::Motion | Self::Contact => Interface::INT,
            Self::Temperature => Interface::TEMP,
            Self::Particles => Interface::HPM,
            Self::Gasses => Interface::CCS,
            Self::Force => Interface::HX,
            Self::Current => Interface::CUR,
            Self::Identity | Self::Na7 | Self::Proximity | Self::Presence | Self::None => {
                Interface::NONE
            }
        }
    }
}

/// Hardware interface bitmask a peripheral uses to sample a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interface(u16);

impl Interface {
    pub const NONE: Self = Self(0);
    pub const ADC: Self = Self(1);
    pub const INT: Self = Self(1 << 1);
    pub const TEMP: Self = Self(1 << 2);
    pub const ADS: Self = Self(1 << 3);
    pub const PMS: Self = Self(1 << 5);
    pub const CCS: Self = Self(1 << 6);
    pub const HX: Self = Self(1 << 7);
    pub const CUR: Self = Self(1 << 8);
    pub const SHT: Self = Self(1 << 9);
    pub const HPM: Self = Self(1 << 10);

    pub const fn bits(self) -> u16 {
        self.0
    }
}

// ───────────────────────────────────────────────────────────────
// Destination scopes
// ───────────────────────────────────────────────────────────────

/// Bitset over delivery destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Scopes(u8);

impl Scopes {
    pub const NONE: Self = Self(0);
    /// Time-series store.
    pub const INFLUX: Self = Self(1);
    /// Remote device-event API.
    pub const SMARTTHINGS: Self = Self(1 << 1);
    pub const NOTIFY: Self = Self(1 << 2);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Routing decision for one sensor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopePolicy {
    pub scopes: Scopes,
    /// Deliver even when the value did not change.
    pub force: bool,
}

/// The fixed per-type routing table.
///
/// Battery readings also go to the time-series store when they come from
/// sensor index 0 (the device's primary slot).
pub fn scope_policy(kind: SensorType, sensor_index: u8) -> ScopePolicy {
    match kind {
        SensorType::Battery => ScopePolicy {
            scopes: if sensor_index == 0 {
                Scopes::SMARTTHINGS.union(Scopes::INFLUX)
            } else {
                Scopes::SMARTTHINGS
            },
            force: false,
        },
        SensorType::Contact
        | SensorType::Motion
        | SensorType::Identity
        | SensorType::Presence => ScopePolicy {
            scopes: Scopes::SMARTTHINGS,
            force: true,
        },
        SensorType::Light => ScopePolicy {
            scopes: Scopes::INFLUX,
            force: true,
        },
        _ => ScopePolicy {
            scopes: Scopes::INFLUX,
            force: false,
        },
    }
}

// ───────────────────────────────────────────────────────────────
// Value vocabularies
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u16)]
pub enum Presence {
    Present = 0,
    NotPresent = 1,
    #[default]
    Unknown = 2,
}

impl Presence {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::NotPresent => "not present",
            Self::Unknown => "unknown",
        }
    }
}

/// Human-readable form of a reading for the event API.
/// Returns `None` for numeric sensor types.
pub fn value_label(kind: SensorType, value: u16) -> Option<&'static str> {
    match (kind, value) {
        (SensorType::Motion, 0) => Some("inactive"),
        (SensorType::Motion, 1) => Some("active"),
        (SensorType::Contact, 0) => Some("closed"),
        (SensorType::Contact, 1) => Some("open"),
        (SensorType::Presence, 0) => Some(Presence::Present.as_str()),
        (SensorType::Presence, 1) => Some(Presence::NotPresent.as_str()),
        (SensorType::Presence, _) => Some(Presence::Unknown.as_str()),
        _ => None,
    }
}

// ───────────────────────────────────────────────────────────────
// Sensor slot
// ───────────────────────────────────────────────────────────────

/// One sensor position on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sensor {
    pub kind: SensorType,
    pub in_use: bool,
    /// Last reported value.
    pub state: u16,
    /// Slot-local position on the owning device.
    pub index: u8,
    pub updated_at: u64,
}

impl Sensor {
    pub const EMPTY: Self = Self {
        kind: SensorType::None,
        in_use: false,
        state: 0,
        index: 0,
        updated_at: 0,
    };

    /// A fresh in-use sensor of `kind` at `index`.
    pub const fn assigned(kind: SensorType, index: u8) -> Self {
        Self {
            kind,
            in_use: true,
            state: 0,
            index,
            updated_at: 0,
        }
    }

    pub const fn interface(&self) -> Interface {
        self.kind.interface()
    }

    /// Apply a new reading.  Returns the destinations to notify, or
    /// `None` when the value is unchanged and no force applies.
    pub fn apply(&mut self, value: u16, now_ms: u64, force_window_ms: u64) -> Option<Scopes> {
        let policy = scope_policy(self.kind, self.index);
        if self.kind == SensorType::Battery {
            return Some(policy.scopes);
        }

        let value = if self.kind == SensorType::Light && value > LIGHT_MAX {
            0
        } else {
            value
        };

        let stale = now_ms > self.updated_at.saturating_add(force_window_ms);
        if value == self.state && !(policy.force || stale) {
            return None;
        }

        self.state = value;
        self.updated_at = now_ms;
        Some(policy.scopes)
    }
}

impl Default for Sensor {
    fn default() -> Self {
        Self::EMPTY
    }
}

// ───────────────────────────────────────────────────────────────
// Notification payload
// ───────────────────────────────────────────────────────────────

/// A decoded data-characteristic notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReading {
    pub sensor_index: u8,
    pub kind: SensorType,
    pub value: u32,
}

impl SensorReading {
    /// Decode `[index, type, value (big-endian, 1/2/4 bytes)]`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let [index, type_id, value @ ..] = bytes else {
            return Err(ProtocolError::ShortPayload);
        };
        let kind = SensorType::from_id(*type_id).ok_or(ProtocolError::UnknownSensorType(*type_id))?;
        let value = match *value {
            [] => return Err(ProtocolError::ShortPayload),
            [b] => u32::from(b),
            [hi, lo] => u32::from(u16::from_be_bytes([hi, lo])),
            [a, b, c, d] => u32::from_be_bytes([a, b, c, d]),
            _ => return Err(ProtocolError::BadValueWidth),
        };
        Ok(Self {
            sensor_index: *index,
            kind,
            value,
        })
    }

    /// Sensor state is 16 bits wide; wider readings saturate.
    pub fn state_value(&self) -> u16 {
        u16::try_from(self.value).unwrap_or(u16::MAX)
    }
}

// ───────────────────────────────────────────────────────────────
// Remote configuration record
// ───────────────────────────────────────────────────────────────

/// The 4-byte sensor layout stored on the peripheral's config
/// characteristic.  Zero means the peripheral has never been configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteConfig(pub u32);

impl RemoteConfig {
    /// Build the record from the in-use sensors of a device.
    pub fn encode(sensors: &[Sensor]) -> Self {
        let mut bytes = [0u8; 4];
        for (i, sensor) in sensors.iter().enumerate().take(2) {
            if !sensor.in_use {
                continue;
            }
            bytes[i * 2] = (sensor.interface().bits() & 0xff) as u8;
            bytes[i * 2 + 1] = sensor.kind.id();
        }
        Self(u32::from_le_bytes(bytes))
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(Self(u32::from_le_bytes(raw)))
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn is_unconfigured(self) -> bool {
        self.0 == 0
    }

    /// Sensor types the peripheral reports for index 0 and 1.
    pub fn sensor_types(self) -> [Option<SensorType>; 2] {
        let b = self.to_le_bytes();
        // A zero byte is an empty slot, not a Battery sensor.
        [b[1], b[3]].map(|id| match SensorType::from_id(id) {
            _ if id == 0 => None,
            Some(SensorType::None) | None => None,
            t => t,
        })
    }
}

// ───────────────────────────────────────────────────────────────
// Peripheral commands (written to the config characteristic)
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Ask the peripheral to re-send the value of one sensor.
    RefreshAttribute(u8),
    /// Reboot the peripheral into its firmware-update loader.
    EnterDfu,
}

impl DeviceCommand {
    pub const fn to_bytes(self) -> [u8; 4] {
        match self {
            Self::RefreshAttribute(idx) => [0xff, 0xff, 0x01, idx],
            Self::EnterDfu => [0xff, 0xff, 0xfe, 0x00],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_table_round_trips_ids_and_names() {
        for t in SensorType::ALL {
            assert_eq!(SensorType::from_id(t.id()), Some(t));
            assert_eq!(SensorType::from_name(t.name()), Some(t));
        }
        assert_eq!(SensorType::from_id(255), Some(SensorType::None));
        assert_eq!(SensorType::from_id(15), None);
        assert_eq!(SensorType::from_name("presence"), Some(SensorType::Presence));
    }

    #[test]
    fn interfaces_match_table() {
        assert_eq!(SensorType::Battery.interface(), Interface::ADC);
        assert_eq!(SensorType::Motion.interface().bits(), 2);
        assert_eq!(SensorType::Particles.interface().bits(), 1024);
        assert_eq!(SensorType::Current.interface().bits(), 256);
        assert_eq!(SensorType::Presence.interface(), Interface::NONE);
    }

    #[test]
    fn motion_routes_to_smartthings_forced() {
        let p = scope_policy(SensorType::Motion, 1);
        assert_eq!(p.scopes, Scopes::SMARTTHINGS);
        assert!(p.force);
    }

    #[test]
    fn battery_primary_slot_adds_influx() {
        let primary = scope_policy(SensorType::Battery, 0);
        assert!(primary.scopes.contains(Scopes::INFLUX));
        assert!(primary.scopes.contains(Scopes::SMARTTHINGS));
        let secondary = scope_policy(SensorType::Battery, 1);
        assert_eq!(secondary.scopes, Scopes::SMARTTHINGS);
    }

    #[test]
    fn unchanged_value_is_suppressed_until_stale() {
        let mut s = Sensor::assigned(SensorType::Humidity, 0);
        assert!(s.apply(40, 1_000, 120_000).is_some());
        assert!(s.apply(40, 2_000, 120_000).is_none());
        assert_eq!(s.apply(40, 121_001, 120_000), Some(Scopes::INFLUX));
        assert_eq!(s.updated_at, 121_001);
    }

    #[test]
    fn forced_types_deliver_repeats() {
        let mut s = Sensor::assigned(SensorType::Contact, 0);
        assert!(s.apply(1, 10, 120_000).is_some());
        assert!(s.apply(1, 20, 120_000).is_some());
    }

    #[test]
    fn light_clamps_overflow_to_zero() {
        let mut s = Sensor::assigned(SensorType::Light, 0);
        s.apply(0x1000, 5, 120_000);
        assert_eq!(s.state, 0);
        s.apply(0x0fff, 6, 120_000);
        assert_eq!(s.state, 0x0fff);
    }

    #[test]
    fn battery_does_not_touch_state() {
        let mut s = Sensor::assigned(SensorType::Battery, 0);
        assert!(s.apply(87, 5, 120_000).is_some());
        assert_eq!(s.state, 0);
        assert_eq!(s.updated_at, 0);
    }

    #[test]
    fn decode_widths() {
        let r = SensorReading::decode(&[1, 2, 0x01]).unwrap();
        assert_eq!((r.sensor_index, r.kind, r.value), (1, SensorType::Motion, 1));
        let r = SensorReading::decode(&[0, 3, 0x01, 0x2c]).unwrap();
        assert_eq!(r.value, 300);
        let r = SensorReading::decode(&[0, 14, 0x00, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(r.value, 65_536);
        assert_eq!(r.state_value(), u16::MAX);
    }

    #[test]
    fn decode_rejects_malformed() {
        assert_eq!(SensorReading::decode(&[0, 2]), Err(ProtocolError::ShortPayload));
        assert_eq!(
            SensorReading::decode(&[0, 2, 1, 2, 3]),
            Err(ProtocolError::BadValueWidth)
        );
        assert_eq!(
            SensorReading::decode(&[0, 77, 1]),
            Err(ProtocolError::UnknownSensorType(77))
        );
    }

    #[test]
    fn remote_config_layout() {
        let sensors = [
            Sensor::assigned(SensorType::Motion, 0),
            Sensor::assigned(SensorType::Temperature, 1),
        ];
        let cfg = RemoteConfig::encode(&sensors);
        assert_eq!(cfg.to_le_bytes(), [2, 2, 4, 4]);
        assert_eq!(
            cfg.sensor_types(),
            [Some(SensorType::Motion), Some(SensorType::Temperature)]
        );
    }

    #[test]
    fn remote_config_skips_unused_sensors() {
        let sensors = [Sensor::assigned(SensorType::Contact, 0), Sensor::EMPTY];
        let cfg = RemoteConfig::encode(&sensors);
        assert_eq!(cfg.to_le_bytes(), [2, 5, 0, 0]);
        assert_eq!(cfg.sensor_types(), [Some(SensorType::Contact), None]);
        assert!(RemoteConfig(0).is_unconfigured());
    }

    #[test]
    fn command_bytes() {
        assert_eq!(DeviceCommand::RefreshAttribute(1).to_bytes(), [0xff, 0xff, 0x01, 1]);
        assert_eq!(DeviceCommand::EnterDfu.to_bytes(), [0xff, 0xff, 0xfe, 0x00]);
    }

    #[test]
    fn labels_for_event_api() {
        assert_eq!(value_label(SensorType::Presence, 1), Some("not present"));
        assert_eq!(value_label(SensorType::Contact, 1), Some("open"));
        assert_eq!(value_label(SensorType::Humidity, 1), None);
    }
}
