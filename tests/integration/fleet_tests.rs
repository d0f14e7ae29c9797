//! Fleet service behaviour outside the main scenarios: telemetry
//! routing, housekeeping, device commands and reset triggers.

use sensorhub::app::events::{HubEvent, NotifySource, ResetReason, TransportEvent};
use sensorhub::app::service::FleetService;
use sensorhub::arbiter::Arbiter;
use sensorhub::config::FleetConfig;
use sensorhub::error::{Error, TransportError};
use sensorhub::link::StateId;
use sensorhub::scan::ScanStart;
use sensorhub::sensor::{DeviceCommand, SensorType};
use sensorhub::telemetry::Outbox;

use crate::mock_ble::{CentralCall, MockDirectory};
use crate::scenario_tests::{Rig, id, static_config};

#[test]
fn battery_level_fans_out_to_every_sensor() {
    let cfg = FleetConfig::default();
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::found(&[SensorType::Motion, SensorType::Temperature]));
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    let t = rig.handshake(&mut fleet, slot, 1_001);

    assert!(rig.notify(&mut fleet, slot, NotifySource::Battery, &[87], t + 1));
    // Index 0 also feeds the time series; both feed the event API.
    assert_eq!(outbox.influx.len(), 1);
    assert_eq!(outbox.smartthings.len(), 2);
    let line = outbox.influx.pop().unwrap();
    assert_eq!(
        line.body.as_str(),
        "BATTERY,device_id=c4:7c:8d:6a:1f:02,sensor_id=0 BATTERY=87"
    );
}

#[test]
fn battery_for_one_sensor_keeps_its_slot_type() {
    let cfg = FleetConfig::default();
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::found(&[SensorType::Motion, SensorType::Temperature]));
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    let t = rig.handshake(&mut fleet, slot, 1_001);

    assert!(rig.notify(&mut fleet, slot, NotifySource::Data, &[1, 0, 55], t + 1));
    assert_eq!(outbox.smartthings.len(), 1);
    assert!(outbox.influx.is_empty());
    let sensors = fleet.registry().slot(slot).unwrap().sensors;
    assert_eq!(sensors[1].kind, SensorType::Temperature);
}

#[test]
fn notifications_need_a_subscribed_link() {
    let cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Motion);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    rig.poll(&mut fleet, 1_000);
    rig.poll(&mut fleet, 1_001);
    assert_eq!(fleet.link_state(slot), Some(StateId::Authenticating));
    assert!(!rig.notify(&mut fleet, slot, NotifySource::Data, &[0, 2, 1], 1_002));
    assert!(outbox.smartthings.is_empty());
}

#[test]
fn mismatched_and_malformed_payloads_are_dropped() {
    let cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Motion);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    let t = rig.handshake(&mut fleet, slot, 1_001);

    // Temperature on a Motion slot.
    assert!(!rig.notify(&mut fleet, slot, NotifySource::Data, &[0, 4, 0, 21], t + 1));
    // Three value bytes.
    assert!(!rig.notify(&mut fleet, slot, NotifySource::Data, &[0, 2, 0, 0, 1], t + 2));
    // Index past the sensor table.
    assert!(!rig.notify(&mut fleet, slot, NotifySource::Data, &[7, 2, 1], t + 3));
    assert!(outbox.influx.is_empty());
    assert!(outbox.smartthings.is_empty());
}

#[test]
fn unchanged_value_is_forced_only_after_the_window() {
    let cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Temperature);
    let window = u64::from(cfg.force_update_ms);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    let t = rig.handshake(&mut fleet, slot, 1_001);

    rig.notify(&mut fleet, slot, NotifySource::Data, &[0, 4, 0, 21], t + 1);
    rig.notify(&mut fleet, slot, NotifySource::Data, &[0, 4, 0, 21], t + 2);
    assert_eq!(outbox.influx.len(), 1);
    rig.notify(&mut fleet, slot, NotifySource::Data, &[0, 4, 0, 21], t + 2 + window);
    assert_eq!(outbox.influx.len(), 2);
}

#[test]
fn housekeeping_prunes_silent_device_and_closes_its_link() {
    let cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Motion);
    let timeout = u64::from(cfg.device_timeout_ms);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    rig.handshake(&mut fleet, slot, 1_001);

    assert_eq!(fleet.housekeeping(2_000, &mut rig.central, &mut rig.sink), None);

    let pruned = fleet.housekeeping(1_001 + timeout, &mut rig.central, &mut rig.sink);
    assert_eq!(pruned, Some(slot));
    assert_eq!(rig.central.count(|c| matches!(c, CentralCall::Disconnect(_))), 1);
    assert_eq!(fleet.registry().in_use_count(), 0);
    assert!(rig.sink.events.contains(&HubEvent::DevicePruned { slot, id: id() }));
    assert!(arbiter.all_free());
}

#[test]
fn presence_tags_are_never_pruned() {
    let cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Presence);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);
    assert_eq!(fleet.housekeeping(10_000_000, &mut rig.central, &mut rig.sink), None);
    assert_eq!(fleet.registry().in_use_count(), 1);
}

#[test]
fn departure_is_reported_after_the_depart_delay() {
    let cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Presence);
    let depart = u64::from(cfg.depart_delay_ms);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    rig.central.config_word = 0x0d00;
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    let t = rig.handshake(&mut fleet, slot, 1_001);
    fleet.presence_sweep(t + 1, &mut rig.reset, &mut rig.sink);
    outbox.smartthings.pop();

    let handle = fleet.registry().slot(slot).unwrap().connection.unwrap().handle.unwrap();
    fleet.handle_transport_event(&TransportEvent::Disconnected { handle }, t + 10, &mut rig.central);
    rig.poll(&mut fleet, t + 11);
    assert_eq!(fleet.link_state(slot), Some(StateId::Closing));

    assert_eq!(fleet.presence_sweep(t + 10 + depart - 1, &mut rig.reset, &mut rig.sink), 0);
    assert_eq!(fleet.presence_sweep(t + 10 + depart, &mut rig.reset, &mut rig.sink), 1);
    let record = outbox.smartthings.pop().unwrap();
    assert!(record.body.contains("\"not present\""));
}

#[test]
fn commands_need_a_subscribed_link() {
    let cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Motion);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);

    assert_eq!(
        fleet.request_attribute_update(&id(), 0, &mut rig.central),
        Err(Error::Transport(TransportError::Disconnected))
    );

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    rig.handshake(&mut fleet, slot, 1_001);
    let before = rig.central.writes().len();
    fleet.request_attribute_update(&id(), 1, &mut rig.central).unwrap();
    fleet.request_dfu(&id(), &mut rig.central).unwrap();
    let writes = rig.central.writes();
    assert_eq!(
        &writes[before..],
        [
            DeviceCommand::RefreshAttribute(1).to_bytes(),
            DeviceCommand::EnterDfu.to_bytes()
        ]
    );
}

#[test]
fn repeated_scan_failures_request_a_reset() {
    let cfg = FleetConfig::default();
    let threshold = cfg.scan_fail_threshold;
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    rig.central.scan_fails = true;
    fleet.start(0, &mut rig.sink);

    for _ in 0..=threshold {
        assert_eq!(
            fleet.start_scan(&mut rig.central, &mut rig.reset, &mut rig.sink),
            ScanStart::Failed
        );
    }
    assert!(rig.reset.reasons.is_empty());
    fleet.start_scan(&mut rig.central, &mut rig.reset, &mut rig.sink);
    assert_eq!(rig.reset.reasons, [ResetReason::ScanFailures]);
    assert!(rig.sink.events.contains(&HubEvent::ResetRequested(ResetReason::ScanFailures)));

    rig.central.scan_fails = false;
    assert_eq!(
        fleet.start_scan(&mut rig.central, &mut rig.reset, &mut rig.sink),
        ScanStart::Started
    );
    assert_eq!(fleet.scan_failures(), 0);
}

#[test]
fn capacity_error_when_no_slot_is_free() {
    let cfg = static_config(
        &[
            "aa:bb:cc:dd:ee:01",
            "aa:bb:cc:dd:ee:02",
            "aa:bb:cc:dd:ee:03",
            "aa:bb:cc:dd:ee:04",
        ],
        SensorType::Motion,
    );
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);

    let err = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap_err();
    assert!(matches!(err, Error::Capacity(_)));
    assert_eq!(arbiter.held_count(), 0);
}
