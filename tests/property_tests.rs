//! Property tests for the collector's core invariants.
//!
//! Runs on host (x86_64) only; proptest is not available for ESP32 targets.
//! On ESP32, these tests are compiled out.

#![cfg(not(target_os = "espidf"))]

use proptest::prelude::*;
use sensorhub::arbiter::{Arbiter, LockId};
use sensorhub::config::FleetConfig;
use sensorhub::presence::PresenceDetector;
use sensorhub::registry::{Connection, DeviceId, MAX_DEVICES, Registry};
use sensorhub::sensor::{RemoteConfig, Scopes, Sensor, SensorReading, SensorType, scope_policy};

// ── Arbiter: at most one lock held ────────────────────────────

#[derive(Debug, Clone)]
enum LockOp {
    Take(usize),
    Give(usize),
}

fn arb_lock_op() -> impl Strategy<Value = LockOp> {
    prop_oneof![
        (0..MAX_DEVICES).prop_map(LockOp::Take),
        (0..MAX_DEVICES).prop_map(LockOp::Give),
    ]
}

proptest! {
    /// Whatever the interleaving of takes and gives, never more than one
    /// lock is held, and a take only succeeds when no other lock is.
    #[test]
    fn arbiter_is_mutually_exclusive(ops in proptest::collection::vec(arb_lock_op(), 1..=64)) {
        let arbiter = Arbiter::new();
        let locks: Vec<LockId> = (0..MAX_DEVICES).map(|_| arbiter.assign().unwrap()).collect();
        prop_assert!(arbiter.assign().is_none());

        for op in ops {
            match op {
                LockOp::Take(i) => {
                    let other_held = locks
                        .iter()
                        .enumerate()
                        .any(|(j, l)| j != i && arbiter.status(*l));
                    let taken = arbiter.try_take(locks[i]);
                    prop_assert_eq!(taken, !other_held);
                }
                LockOp::Give(i) => {
                    arbiter.give(locks[i]);
                    prop_assert!(!arbiter.status(locks[i]));
                }
            }
            prop_assert!(arbiter.held_count() <= 1);
            prop_assert_eq!(arbiter.all_free(), arbiter.held_count() == 0);
        }
    }
}

// ── Backoff gate ──────────────────────────────────────────────

proptest! {
    /// At or above the threshold an attempt is allowed exactly when more
    /// than `retry_count * unit` has passed; below it, always.
    #[test]
    fn backoff_is_linear_in_retry_count(
        failures in 1u8..=20,
        threshold in 0u8..=5,
        unit in 1u32..=5_000,
        last in 0u64..=1_000_000,
        elapsed in 0u64..=200_000,
    ) {
        let mut conn = Connection::new(LockId::new(0));
        for _ in 0..failures {
            conn.record_failure(last);
        }
        let allowed = conn.may_attempt(last + elapsed, threshold, unit);
        if failures < threshold {
            prop_assert!(allowed);
        } else {
            prop_assert_eq!(allowed, elapsed > u64::from(failures) * u64::from(unit));
        }

        conn.record_success();
        prop_assert!(conn.may_attempt(last, threshold, unit));
    }
}

// ── Scope policy ──────────────────────────────────────────────

proptest! {
    #[test]
    fn every_type_has_a_destination(idx in 0usize..15, sensor_index in 0u8..2) {
        let kind = SensorType::ALL[idx];
        let policy = scope_policy(kind, sensor_index);
        prop_assert!(!policy.scopes.is_empty());
        let battery_to_influx = kind == SensorType::Battery && sensor_index == 0;
        if kind == SensorType::Battery {
            prop_assert!(policy.scopes.contains(Scopes::SMARTTHINGS));
            prop_assert_eq!(policy.scopes.contains(Scopes::INFLUX), battery_to_influx);
        }
    }

    /// A non-forced sensor reports a repeated value only once per window.
    #[test]
    fn unchanged_values_are_suppressed_within_the_window(
        value in 1u16..=1_000,
        gap in 0u64..=120_000,
    ) {
        let mut sensor = Sensor::assigned(SensorType::Temperature, 1);
        prop_assert!(sensor.apply(value, 1_000, 120_000).is_some());
        prop_assert!(sensor.apply(value, 1_000 + gap, 120_000).is_none());
        prop_assert!(sensor.apply(value, 1_000 + 120_001, 120_000).is_some());
    }
}

// ── Presence debounce ─────────────────────────────────────────

proptest! {
    /// A departure is never reported before the depart delay, and always
    /// is once it has passed.
    #[test]
    fn departure_waits_for_the_delay(
        depart_at in 1_000u64..=1_000_000,
        probe in 0u64..=200_000,
    ) {
        let cfg = FleetConfig::default();
        let delay = u64::from(cfg.depart_delay_ms);
        let arbiter = Arbiter::new();
        let detector = PresenceDetector::new(&cfg);
        let mut reg = Registry::from_config(&cfg);
        reg.create(&DeviceId::from_addr([0xc4, 0x7c, 0x8d, 0x6a, 0x1f, 0x02]), 0, &arbiter);
        reg.add_sensor(0, SensorType::Presence);

        detector.on_disconnected(&mut reg, 0, depart_at);
        let emitted = detector.sweep(&mut reg, depart_at + probe);
        prop_assert_eq!(emitted.len(), usize::from(probe >= delay));
    }

    /// Arrival and departure cancel each other: only the latest counts.
    #[test]
    fn latest_presence_event_wins(arrive_last in any::<bool>(), t in 1_000u64..=1_000_000) {
        let cfg = FleetConfig::default();
        let arbiter = Arbiter::new();
        let detector = PresenceDetector::new(&cfg);
        let mut reg = Registry::from_config(&cfg);
        reg.create(&DeviceId::from_addr([0xc4, 0x7c, 0x8d, 0x6a, 0x1f, 0x03]), 0, &arbiter);
        reg.add_sensor(0, SensorType::Presence);

        if arrive_last {
            detector.on_disconnected(&mut reg, 0, t);
            detector.on_authenticated(&mut reg, 0, t + 1);
        } else {
            detector.on_authenticated(&mut reg, 0, t);
            detector.on_disconnected(&mut reg, 0, t + 1);
        }
        let state = reg.presence(0).copied().unwrap();
        prop_assert_eq!(state.arrived, arrive_last);
        prop_assert_eq!(state.departed, !arrive_last);
    }
}

// ── Wire formats ──────────────────────────────────────────────

proptest! {
    /// Arbitrary notification bytes decode or fail with a typed error.
    #[test]
    fn notification_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..=8)) {
        if let Ok(reading) = SensorReading::decode(&bytes) {
            prop_assert_eq!(reading.sensor_index, bytes[0]);
            prop_assert_eq!(reading.kind.id(), bytes[1]);
        }
    }

    #[test]
    fn device_ids_normalise_to_lowercase(addr in any::<[u8; 6]>()) {
        let id = DeviceId::from_addr(addr);
        prop_assert_eq!(id.to_addr(), addr);
        let upper = id.as_str().to_uppercase();
        prop_assert_eq!(DeviceId::parse(&upper).unwrap(), id);
    }

    /// The layout written to a peripheral reads back as the same types.
    #[test]
    fn remote_config_reflects_layout(a in 1usize..15, b in 1usize..15) {
        let first = SensorType::ALL[a];
        let second = SensorType::ALL[b];
        let sensors = [Sensor::assigned(first, 0), Sensor::assigned(second, 1)];
        let record = RemoteConfig::encode(&sensors);
        prop_assert!(!record.is_unconfigured());
        prop_assert_eq!(record.sensor_types(), [Some(first), Some(second)]);
    }
}
