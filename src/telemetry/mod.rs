//! Telemetry pipeline.
//!
//! ```text
//!  notification ─▶ process() ─▶ lookup slot ─▶ sensor.apply() ─▶ scopes
//!                                                                  │
//!        ┌──────────────── dispatch() ◀────────────────────────────┘
//!        ├─ INFLUX      ─▶ influx_line()    ─▶ Outbox::influx
//!        └─ SMARTTHINGS ─▶ event_document() ─▶ Outbox::smartthings
//! ```
//!
//! A payload lives for one `process()` call.  Queues only ever hold the
//! serialised [`DeliveryRecord`].

pub mod format;
pub mod queue;

use heapless::{String, Vec};
use log::{debug, error, warn};

pub use queue::{DeliveryOutcome, DeliveryQueue, HealthMonitor, MAX_QUEUE_DEPTH, Serviced};

use crate::config::FleetConfig;
use crate::error::{Error, ProtocolError};
use crate::presence::PresenceEmission;
use crate::registry::{DeviceId, Registry};
use crate::sensor::{MAX_SENSORS, Scopes, SensorReading, SensorType, scope_policy};

pub const MAX_ATTRIBUTES: usize = 4;

// ═══════════════════════════════════════════════════════════════
// Payload
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub name: &'static str,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: &'static str,
    pub value: String<16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryPayload {
    pub device_id: DeviceId,
    pub sensor_id: u8,
    pub sensor_type: SensorType,
    pub attributes: Vec<Attribute, MAX_ATTRIBUTES>,
    pub tags: Vec<Tag, MAX_ATTRIBUTES>,
    pub scopes: Scopes,
}

impl TelemetryPayload {
    /// Single-value payload; the attribute is named after the sensor type.
    pub fn reading(device_id: DeviceId, sensor_id: u8, sensor_type: SensorType, value: u32) -> Self {
        let mut attributes = Vec::new();
        let _ = attributes.push(Attribute {
            name: sensor_type.name(),
            value,
        });
        Self {
            device_id,
            sensor_id,
            sensor_type,
            attributes,
            tags: Vec::new(),
            scopes: Scopes::NONE,
        }
    }

    pub fn from_reading(device_id: DeviceId, reading: &SensorReading) -> Self {
        Self::reading(device_id, reading.sensor_index, reading.kind, reading.value)
    }

    pub fn push_attribute(&mut self, name: &'static str, value: u32) -> Result<(), Attribute> {
        self.attributes.push(Attribute { name, value })
    }

    /// The primary value.
    pub fn value(&self) -> u32 {
        self.attributes.first().map_or(0, |a| a.value)
    }
}

/// A serialised record as held by a delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    /// Destination-relative path; empty for the time-series store.
    pub endpoint: String<40>,
    pub body: String<192>,
    pub retried: bool,
}

// ═══════════════════════════════════════════════════════════════
// Outbox: the per-destination queues plus the health counter
// ═══════════════════════════════════════════════════════════════

pub struct Outbox {
    pub influx: DeliveryQueue,
    pub smartthings: DeliveryQueue,
    pub health: HealthMonitor,
}

impl Outbox {
    pub fn new(config: &FleetConfig) -> Self {
        let depth = usize::from(config.queue_depth);
        Self {
            influx: DeliveryQueue::new(Scopes::INFLUX, depth),
            smartthings: DeliveryQueue::new(Scopes::SMARTTHINGS, depth),
            health: HealthMonitor::new(config.error_reset_threshold),
        }
    }
}

/// Result of handing one payload to its destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandOff {
    pub influx_queued: bool,
    pub smartthings_queued: bool,
    /// Event destination was selected but the record was not queued.
    pub smartthings_failed: bool,
    /// The health counter asked for a reset.
    pub reset: bool,
}

/// What `process` did with a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub slot: usize,
    pub sensor_type: SensorType,
    /// One entry per payload actually dispatched.
    pub hand_offs: Vec<HandOff, MAX_SENSORS>,
}

impl Processed {
    pub fn reset_requested(&self) -> bool {
        self.hand_offs.iter().any(|h| h.reset)
    }

    pub fn smartthings_ok(&self) -> bool {
        self.hand_offs.iter().all(|h| !h.smartthings_failed)
    }
}

// ═══════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════

pub struct Pipeline {
    force_window_ms: u64,
}

impl Pipeline {
    pub fn new(config: &FleetConfig) -> Self {
        Self {
            force_window_ms: u64::from(config.force_update_ms),
        }
    }

    /// Route one payload.  Unknown devices and type mismatches are
    /// dropped with an error log.
    pub fn process(
        &self,
        registry: &mut Registry,
        outbox: &Outbox,
        payload: TelemetryPayload,
        now_ms: u64,
    ) -> Result<Processed, Error> {
        let Some(slot) = registry.lookup_index(&payload.device_id) else {
            error!("telemetry: no such device {}", payload.device_id);
            return Err(ProtocolError::UnknownDevice.into());
        };
        let max_sensors = registry.max_sensors();
        let mut processed = Processed {
            slot,
            sensor_type: payload.sensor_type,
            hand_offs: Vec::new(),
        };

        let Some(device) = registry.slot_mut(slot) else {
            return Err(ProtocolError::UnknownDevice.into());
        };
        device.last_seen = now_ms;

        // Device-level battery: one update per in-use sensor.
        if payload.sensor_type == SensorType::Battery && usize::from(payload.sensor_id) == max_sensors {
            debug!("telemetry: device-level battery for {}", payload.device_id);
            let sensors = device.sensors;
            for sensor in sensors.iter().take(max_sensors).filter(|s| s.in_use) {
                let mut each = TelemetryPayload::reading(
                    payload.device_id.clone(),
                    sensor.index,
                    SensorType::Battery,
                    payload.value(),
                );
                each.scopes = scope_policy(SensorType::Battery, sensor.index).scopes;
                let _ = processed.hand_offs.push(self.dispatch(outbox, &each));
            }
            return Ok(processed);
        }

        let index = usize::from(payload.sensor_id);
        if index >= max_sensors {
            error!("telemetry: sensor index {index} out of range");
            return Err(ProtocolError::SensorIndexOutOfRange(payload.sensor_id).into());
        }
        let sensor = &mut device.sensors[index];

        // Per-sensor battery rides on whatever type the sensor carries.
        if payload.sensor_type == SensorType::Battery && sensor.in_use {
            let mut payload = payload;
            payload.scopes = scope_policy(SensorType::Battery, payload.sensor_id).scopes;
            let _ = processed.hand_offs.push(self.dispatch(outbox, &payload));
            return Ok(processed);
        }
        if sensor.kind != payload.sensor_type {
            error!(
                "telemetry: sensor/type mismatch, slot sensor = {} / payload = {}",
                sensor.kind.name(),
                payload.sensor_type.name()
            );
            return Err(ProtocolError::SensorMismatch {
                index: payload.sensor_id,
                expected: sensor.kind.id(),
                got: payload.sensor_type.id(),
            }
            .into());
        }

        let value = u16::try_from(payload.value()).unwrap_or(u16::MAX);
        let Some(scopes) = sensor.apply(value, now_ms, self.force_window_ms) else {
            debug!("telemetry: {} unchanged", payload.sensor_type.name());
            return Ok(processed);
        };
        let mut payload = payload;
        payload.scopes = scopes;
        // Light may have been clamped.
        if let Some(first) = payload.attributes.first_mut() {
            if payload.sensor_type != SensorType::Battery {
                first.value = u32::from(sensor.state);
            }
        }
        let _ = processed.hand_offs.push(self.dispatch(outbox, &payload));
        Ok(processed)
    }

    /// Publish a presence emission for sensor 0 of its device.  Emissions
    /// skip the type check so Force devices also report presence.
    pub fn emit_presence(
        &self,
        registry: &mut Registry,
        outbox: &Outbox,
        emission: &PresenceEmission,
        now_ms: u64,
    ) -> HandOff {
        let value = emission.presence as u16;
        if let Some(sensor) = registry
            .slot_mut(emission.slot)
            .map(|d| &mut d.sensors[0])
            .filter(|s| s.kind == SensorType::Presence)
        {
            sensor.state = value;
            sensor.updated_at = now_ms;
        }
        let mut payload =
            TelemetryPayload::reading(emission.id.clone(), 0, SensorType::Presence, u32::from(value));
        payload.scopes = scope_policy(SensorType::Presence, 0).scopes;
        self.dispatch(outbox, &payload)
    }

    /// Serialise and enqueue to every selected destination.
    pub fn dispatch(&self, outbox: &Outbox, payload: &TelemetryPayload) -> HandOff {
        let mut hand_off = HandOff::default();
        let mut failures = 0u8;

        if payload.scopes.contains(Scopes::INFLUX) {
            match format::influx_line(payload).map_err(Error::from).and_then(|r| {
                outbox.influx.push(r).map_err(Error::from)
            }) {
                Ok(()) => hand_off.influx_queued = true,
                Err(e) => warn!("telemetry: influx record dropped: {e}"),
            }
        }

        if payload.scopes.contains(Scopes::SMARTTHINGS) {
            match format::event_document(payload).map_err(Error::from).and_then(|r| {
                outbox.smartthings.push(r).map_err(Error::from)
            }) {
                Ok(()) => hand_off.smartthings_queued = true,
                Err(e) => {
                    error!("telemetry: event record for {} not queued: {e}", payload.device_id);
                    hand_off.smartthings_failed = true;
                    failures += 1;
                }
            }
        }

        hand_off.reset = outbox.health.record(failures);
        hand_off
    }
}
