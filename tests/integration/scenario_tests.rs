//! End-to-end collector scenarios driven through `FleetService` with
//! mock adapters: discovery, handshake, presence, admission, delivery
//! retry and watchdog recovery.

use heapless::{String as HString, Vec as HVec};
use sensorhub::app::events::{Advertisement, HubEvent, Notification, NotifySource, TransportEvent};
use sensorhub::app::service::FleetService;
use sensorhub::arbiter::Arbiter;
use sensorhub::config::FleetConfig;
use sensorhub::error::{DeliveryError, Error};
use sensorhub::link::StateId;
use sensorhub::registry::DeviceId;
use sensorhub::scan::ScanStart;
use sensorhub::sensor::{Presence, RemoteConfig, SensorType};
use sensorhub::telemetry::{DeliveryOutcome, Outbox};

use crate::mock_ble::{
    CentralCall, DirectoryCall, MockCentral, MockDirectory, RecordingReset, RecordingSink, ScriptedDelivery,
};

pub const ADDR: [u8; 6] = [0xc4, 0x7c, 0x8d, 0x6a, 0x1f, 0x02];

pub fn id() -> DeviceId {
    DeviceId::from_addr(ADDR)
}

pub fn static_config(ids: &[&str], kind: SensorType) -> FleetConfig {
    let mut cfg = FleetConfig::default();
    for raw in ids {
        cfg.static_devices.push(HString::try_from(*raw).unwrap()).unwrap();
    }
    cfg.static_sensor_type = kind;
    cfg
}

pub fn advertisement(addr: [u8; 6], cfg: &FleetConfig) -> TransportEvent {
    let mut uuids = HVec::new();
    uuids.push(cfg.gatt.service).unwrap();
    TransportEvent::Advertised(Advertisement { addr, uuids })
}

/// Everything a scenario drives the fleet with.
pub struct Rig {
    pub central: MockCentral,
    pub directory: MockDirectory,
    pub reset: RecordingReset,
    pub sink: RecordingSink,
}

impl Rig {
    pub fn new(directory: MockDirectory) -> Self {
        Self {
            central: MockCentral::new(),
            directory,
            reset: RecordingReset::default(),
            sink: RecordingSink::default(),
        }
    }

    pub fn poll(&mut self, fleet: &mut FleetService<'_>, now_ms: u64) {
        fleet.poll_links(now_ms, &mut self.central, &mut self.directory, &mut self.sink);
    }

    /// Run an admitted slot from Idle through to the end of configuration.
    /// Returns the time of the last tick.
    pub fn handshake(&mut self, fleet: &mut FleetService<'_>, slot: usize, t0: u64) -> u64 {
        self.poll(fleet, t0);
        self.poll(fleet, t0 + 1);
        let handle = fleet
            .registry()
            .slot(slot)
            .and_then(|d| d.connection)
            .and_then(|c| c.handle)
            .expect("link handle after connect");
        fleet.handle_transport_event(
            &TransportEvent::Authenticated { handle, ok: true },
            t0 + 2,
            &mut self.central,
        );
        for t in 3..10 {
            self.poll(fleet, t0 + t);
        }
        t0 + 9
    }

    pub fn notify(&mut self, fleet: &mut FleetService<'_>, slot: usize, source: NotifySource, bytes: &[u8], now_ms: u64) -> bool {
        let handle = fleet
            .registry()
            .slot(slot)
            .and_then(|d| d.connection)
            .and_then(|c| c.handle)
            .expect("open link");
        let n = Notification {
            handle,
            source,
            bytes: HVec::from_slice(bytes).unwrap(),
        };
        fleet
            .handle_notification(&n, now_ms, &mut self.reset, &mut self.sink)
            .is_some()
    }
}

// ── Scenario A: first contact with an unseen device ───────────

#[test]
fn unseen_device_is_registered_and_subscribed() {
    let cfg = static_config(&["aa:bb:cc:dd:ee:01"], SensorType::Motion);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg.clone(), &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);
    assert_eq!(fleet.registry().in_use_count(), 1);

    let found = fleet.handle_transport_event(&advertisement(ADDR, &cfg), 1_000, &mut rig.central);
    assert_eq!(found, Some(id()));
    assert!(rig.central.calls.contains(&CentralCall::ScanStop));

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    assert_eq!(slot, 1);
    assert!(rig.sink.events.contains(&HubEvent::DeviceCreated { slot: 1, id: id() }));

    rig.handshake(&mut fleet, slot, 1_001);

    assert_eq!(
        rig.directory.calls,
        [DirectoryCall::GetConfig(id()), DirectoryCall::InitDevice(id())]
    );
    assert_eq!(fleet.link_state(slot), Some(StateId::Subscribed));
    assert_eq!(rig.central.subscriptions(), [NotifySource::Data]);
    // No layout known yet, so nothing to write.
    assert!(rig.central.writes().is_empty());
    assert!(arbiter.all_free());
}

#[test]
fn directory_layout_is_written_to_unconfigured_peripheral() {
    let cfg = FleetConfig::default();
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::found(&[SensorType::Motion, SensorType::Temperature]));
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    rig.handshake(&mut fleet, slot, 1_001);

    assert_eq!(fleet.link_state(slot), Some(StateId::Subscribed));
    let writes = rig.central.writes();
    assert_eq!(writes.len(), 1);
    let written = RemoteConfig(u32::from_le_bytes(writes[0]));
    assert_eq!(
        written.sensor_types(),
        [Some(SensorType::Motion), Some(SensorType::Temperature)]
    );
}

// ── Scenario B: configured presence tag reconnects ───────────

#[test]
fn configured_device_reconnects_and_reports_presence() {
    let cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Presence);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    rig.central.config_word = 0x0d00;
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    let t = rig.handshake(&mut fleet, slot, 1_001);

    assert_eq!(fleet.link_state(slot), Some(StateId::Subscribed));
    assert!(rig.directory.calls.is_empty(), "layout already known");
    assert!(rig.central.writes().is_empty(), "peripheral already configured");
    assert!(fleet.registry().presence(slot).unwrap().arrived);

    assert_eq!(fleet.presence_sweep(t + 1, &mut rig.reset, &mut rig.sink), 1);
    assert!(rig.sink.events.contains(&HubEvent::PresenceChanged {
        slot,
        presence: Presence::Present
    }));
    let record = outbox.smartthings.pop().expect("presence queued");
    assert_eq!(record.endpoint.as_str(), "c4:7c:8d:6a:1f:02-0");
    assert!(record.body.contains("\"present\""));

    // Handed off: nothing pending until the refresh interval.
    assert_eq!(fleet.presence_sweep(t + 2, &mut rig.reset, &mut rig.sink), 0);
}

// ── Scenario C: device table full ─────────────────────────────

#[test]
fn full_table_skips_scan_without_touching_locks() {
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

    let result = fleet.start_scan(&mut rig.central, &mut rig.reset, &mut rig.sink);
    assert_eq!(result, ScanStart::Skipped);
    assert_eq!(rig.central.count(|c| *c == CentralCall::ScanStart), 0);
    assert_eq!(arbiter.held_count(), 0);
    assert_eq!(fleet.scan_failures(), 0);
}

// ── Scenario D: one delivery timeout, then success ────────────

#[test]
fn delivery_retry_leaves_health_counter_unchanged() {
    let cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Motion);
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    let t = rig.handshake(&mut fleet, slot, 1_001);
    assert!(rig.notify(&mut fleet, slot, NotifySource::Data, &[0, 2, 1], t + 1));
    assert_eq!(outbox.smartthings.len(), 1);
    let before = outbox.health.errors();

    let mut port = ScriptedDelivery::new(vec![Err(DeliveryError::Unreachable)]);
    let first = outbox.smartthings.service(&mut port, &outbox.health).unwrap();
    assert_eq!(first.outcome, DeliveryOutcome::Requeued);
    assert_eq!(outbox.smartthings.len(), 1);

    let second = outbox.smartthings.service(&mut port, &outbox.health).unwrap();
    assert_eq!(second.outcome, DeliveryOutcome::Delivered);
    assert!(outbox.smartthings.is_empty());
    assert_eq!(port.sent.len(), 2);
    assert_eq!(port.sent[0].body, port.sent[1].body);
    assert_eq!(outbox.health.errors(), before);
}

// ── Scenario E: watchdog during configuration ─────────────────

#[test]
fn watchdog_mid_configuration_closes_and_backs_off() {
    let mut cfg = static_config(&["c4:7c:8d:6a:1f:02"], SensorType::Motion);
    cfg.retry_threshold = 1;
    let arbiter = Arbiter::new();
    let outbox = Outbox::new(&cfg);
    let mut fleet = FleetService::new(cfg.clone(), &arbiter, &outbox).unwrap();
    let mut rig = Rig::new(MockDirectory::not_found());
    fleet.start(1_000, &mut rig.sink);

    let slot = fleet.connect(&id(), 1_000, &mut rig.central, &mut rig.sink).unwrap();
    rig.poll(&mut fleet, 1_000);
    rig.poll(&mut fleet, 1_001);
    let handle = fleet.registry().slot(slot).unwrap().connection.unwrap().handle.unwrap();
    fleet.handle_transport_event(&TransportEvent::Authenticated { handle, ok: true }, 1_002, &mut rig.central);
    rig.poll(&mut fleet, 1_003);
    rig.poll(&mut fleet, 1_004);
    assert_eq!(fleet.link_state(slot), Some(StateId::Configuring));

    rig.poll(&mut fleet, 10_000);
    assert_eq!(fleet.link_state(slot), Some(StateId::Closing));
    assert!(arbiter.all_free());
    assert!(rig.central.calls.contains(&CentralCall::Disconnect(handle)));
    let conn = fleet.registry().slot(slot).unwrap().connection.unwrap();
    assert_eq!(conn.retry_count, 1);
    assert_eq!(conn.last_attempt, Some(10_000));

    rig.poll(&mut fleet, 10_001);
    assert_eq!(fleet.link_state(slot), Some(StateId::Idle));

    // Inside the backoff window: the advertisement is ignored and a
    // direct attempt is refused.
    assert_eq!(
        fleet.handle_transport_event(&advertisement(ADDR, &cfg), 10_500, &mut rig.central),
        None
    );
    assert_eq!(
        fleet.connect(&id(), 10_500, &mut rig.central, &mut rig.sink),
        Err(Error::Backoff)
    );

    assert_eq!(fleet.connect(&id(), 11_001, &mut rig.central, &mut rig.sink), Ok(slot));
}
