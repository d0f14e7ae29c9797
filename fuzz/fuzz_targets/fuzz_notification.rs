//! Fuzz target: notification decode and the telemetry pipeline
//!
//! Feeds arbitrary notification bytes through `SensorReading::decode`
//! and, when they decode, through `Pipeline::process` against a
//! one-device registry.
//!
//! Invariants checked:
//! - No panics under any byte sequence
//! - Queues never exceed their configured depth
//! - A rejected payload never enqueues anything
//!
//! cargo fuzz run fuzz_notification

#![no_main]

use libfuzzer_sys::fuzz_target;
use sensorhub::arbiter::Arbiter;
use sensorhub::config::FleetConfig;
use sensorhub::registry::{DeviceId, Registry};
use sensorhub::sensor::{SensorReading, SensorType};
use sensorhub::telemetry::{Outbox, Pipeline, TelemetryPayload};

fuzz_target!(|data: &[u8]| {
    let cfg = FleetConfig::default();
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let pipeline = Pipeline::new(&cfg);
    let mut reg = Registry::from_config(&cfg);
    let id = DeviceId::from_addr([0xc4, 0x7c, 0x8d, 0x6a, 0x1f, 0x02]);
    reg.create(&id, 1, &arbiter);
    reg.add_sensor(0, SensorType::Motion);
    reg.add_sensor(0, SensorType::Temperature);

    // Each chunk is one notification, at a growing timestamp.
    for (i, chunk) in data.chunks(6).enumerate() {
        let Ok(reading) = SensorReading::decode(chunk) else {
            continue;
        };
        let before = (outbox.influx.len(), outbox.smartthings.len());
        let payload = TelemetryPayload::from_reading(id.clone(), &reading);
        let result = pipeline.process(&mut reg, &outbox, payload, 1_000 * (i as u64 + 1));
        if result.is_err() {
            assert_eq!((outbox.influx.len(), outbox.smartthings.len()), before);
        }
        assert!(outbox.influx.len() <= usize::from(cfg.queue_depth));
        assert!(outbox.smartthings.len() <= usize::from(cfg.queue_depth));
    }
});
