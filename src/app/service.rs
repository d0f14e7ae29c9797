//! Fleet service: the hexagonal core.
//!
//! [`FleetService`] owns the registry, one link state machine per slot,
//! the presence detector, the telemetry pipeline and the scan
//! coordinator.  It shares the [`Arbiter`] and the [`Outbox`] with the
//! delivery tasks by reference.  All I/O flows through port traits
//! injected at call sites, so the whole service runs under test with
//! mock adapters.
//!
//! ```text
//!  TransportEvent ──▶ ┌───────────────────────────────┐ ──▶ EventSink
//!  Notification   ──▶ │         FleetService          │
//!                     │ Registry · Links · Presence   │ ──▶ Outbox queues
//!  BleCentral     ◀── │ Pipeline · ScanCoordinator    │
//!  DirectoryPort  ◀── └───────────────────────────────┘ ──▶ ResetPort
//! ```

use log::{debug, error, info, warn};

use crate::arbiter::{Arbiter, LockId};
use crate::config::FleetConfig;
use crate::error::{CapacityError, Error, ProtocolError, Result, TransportError};
use crate::link::context::LinkContext;
use crate::link::{Link, StateId};
use crate::presence::{PresenceDetector, PresenceHook};
use crate::registry::{AuthState, DeviceId, MAX_DEVICES, Registry};
use crate::scan::{ScanCoordinator, ScanStart};
use crate::sensor::{DeviceCommand, SensorReading, SensorType};
use crate::telemetry::{Outbox, Pipeline, Processed, TelemetryPayload};

use super::events::{HubEvent, Notification, NotifySource, ResetReason, TransportEvent};
use super::ports::{BleCentral, DirectoryPort, EventSink, NoDirectory, ResetPort};

// ───────────────────────────────────────────────────────────────
// FleetService
// ───────────────────────────────────────────────────────────────

pub struct FleetService<'a> {
    config: FleetConfig,
    registry: Registry,
    links: [Link; MAX_DEVICES],
    presence: PresenceDetector,
    pipeline: Pipeline,
    scan: ScanCoordinator,
    arbiter: &'a Arbiter,
    outbox: &'a Outbox,
}

impl<'a> FleetService<'a> {
    /// Construct the service.  Does **not** load the static device
    /// list; call [`start`](Self::start) next.
    pub fn new(config: FleetConfig, arbiter: &'a Arbiter, outbox: &'a Outbox) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: Registry::from_config(&config),
            links: core::array::from_fn(|_| Link::new()),
            presence: PresenceDetector::new(&config),
            pipeline: Pipeline::new(&config),
            scan: ScanCoordinator::new(&config),
            config,
            arbiter,
            outbox,
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Load the static device list and seed presence state.
    pub fn start(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        let loaded = self.registry.load_static(&self.config, now_ms, self.arbiter);
        if loaded > 0 {
            info!("fleet: {loaded} static devices loaded");
        }
        self.presence.prime(&mut self.registry, now_ms);
        sink.emit(&HubEvent::Started {
            devices: self.registry.in_use_count(),
        });
    }

    pub fn set_presence_hook(&mut self, hook: PresenceHook) {
        self.presence.set_hook(hook);
    }

    // ── Discovery ─────────────────────────────────────────────

    /// Start one discovery window and account for the result.  The
    /// caller waits for the arbiter to drain before calling this.
    pub fn start_scan(
        &mut self,
        central: &mut impl BleCentral,
        reset: &mut impl ResetPort,
        sink: &mut impl EventSink,
    ) -> ScanStart {
        let result = self.scan.start(&self.registry, self.arbiter, central);
        if self.scan.record(result) {
            self.request_reset(ResetReason::ScanFailures, reset, sink);
        }
        result
    }

    /// Route one transport event.  A qualifying advertisement stops the
    /// scan and returns the address to connect to.
    pub fn handle_transport_event(
        &mut self,
        event: &TransportEvent,
        now_ms: u64,
        central: &mut impl BleCentral,
    ) -> Option<DeviceId> {
        match event {
            TransportEvent::Advertised(adv) => {
                let id = self.scan.on_advertisement(adv, &self.registry, now_ms)?;
                info!("fleet: found {id}");
                central.scan_stop();
                Some(id)
            }
            TransportEvent::ScanComplete => {
                debug!("fleet: scan window complete");
                None
            }
            TransportEvent::Authenticated { handle, ok } => {
                let Some(slot) = self.registry.find_by_handle(*handle) else {
                    warn!("fleet: auth result for unknown handle {}", handle.0);
                    return None;
                };
                if let Some(conn) = self.registry.slot_mut(slot).and_then(|d| d.connection.as_mut()) {
                    conn.auth = if *ok { AuthState::Success } else { AuthState::Failed };
                }
                if *ok {
                    self.presence.on_authenticated(&mut self.registry, slot, now_ms);
                } else {
                    warn!("fleet: authentication failed on slot {slot}");
                }
                None
            }
            TransportEvent::Disconnected { handle } => {
                let Some(slot) = self.registry.find_by_handle(*handle) else {
                    debug!("fleet: disconnect for unknown handle {}", handle.0);
                    return None;
                };
                info!("fleet: slot {slot} disconnected");
                if let Some(conn) = self.registry.slot_mut(slot).and_then(|d| d.connection.as_mut()) {
                    conn.handle = None;
                    conn.auth = AuthState::None;
                    self.arbiter.give(conn.lock);
                }
                self.presence.on_disconnected(&mut self.registry, slot, now_ms);
                None
            }
        }
    }

    // ── Connection management ─────────────────────────────────

    /// Resolve `id` to a slot ready for a new attempt, creating it if
    /// needed.  A link still busy from an earlier attempt is closed first.
    /// Returns the slot and the lock the caller must take.
    pub fn admit(
        &mut self,
        id: &DeviceId,
        now_ms: u64,
        central: &mut impl BleCentral,
        sink: &mut impl EventSink,
    ) -> Result<(usize, LockId)> {
        let slot = match self.registry.lookup_index(id) {
            Some(slot) => slot,
            None => {
                let slot = self
                    .registry
                    .create(id, now_ms, self.arbiter)
                    .ok_or(CapacityError::NoDeviceSlot)?
                    .slot_index();
                sink.emit(&HubEvent::DeviceCreated { slot, id: id.clone() });
                slot
            }
        };

        if self.links[slot].state() != StateId::Idle {
            info!("fleet: slot {slot} busy, closing before reconnect");
            self.drive(slot, now_ms, central, &mut NoDirectory, Some(StateId::Closing), sink);
            self.drive(slot, now_ms, central, &mut NoDirectory, None, sink);
        }

        let conn = self
            .registry
            .slot(slot)
            .and_then(|d| d.connection)
            .ok_or(ProtocolError::UnknownDevice)?;
        if !conn.may_attempt(now_ms, self.config.retry_threshold, self.config.backoff_unit_ms) {
            debug!("fleet: {id} backing off ({} retries)", conn.retry_count);
            return Err(Error::Backoff);
        }
        Ok((slot, conn.lock))
    }

    /// Hand a slot whose lock the caller now holds to its state machine.
    pub fn begin_link(&mut self, slot: usize) -> bool {
        let Some(lock) = self.lock_of(slot) else {
            return false;
        };
        if !self.arbiter.status(lock) {
            error!("fleet: slot {slot} lock not held");
            return false;
        }
        self.links[slot].scratch.requested = true;
        true
    }

    /// The lock could not be taken in time.  Counts as a failed attempt.
    pub fn lock_timed_out(&mut self, slot: usize, now_ms: u64) {
        warn!("fleet: slot {slot}: {}", Error::ArbitrationTimeout);
        if let Some(conn) = self.registry.slot_mut(slot).and_then(|d| d.connection.as_mut()) {
            conn.record_failure(now_ms);
        }
    }

    /// Synchronous admission: admit, try the lock once, begin.
    pub fn connect(
        &mut self,
        id: &DeviceId,
        now_ms: u64,
        central: &mut impl BleCentral,
        sink: &mut impl EventSink,
    ) -> Result<usize> {
        let (slot, lock) = self.admit(id, now_ms, central, sink)?;
        if !self.arbiter.try_take(lock) {
            self.lock_timed_out(slot, now_ms);
            return Err(Error::ArbitrationTimeout);
        }
        self.begin_link(slot);
        Ok(slot)
    }

    /// Advance every busy link by one tick.
    pub fn poll_links(
        &mut self,
        now_ms: u64,
        central: &mut impl BleCentral,
        directory: &mut impl DirectoryPort,
        sink: &mut impl EventSink,
    ) {
        for slot in 0..self.registry.capacity() {
            let link = &self.links[slot];
            if link.state() == StateId::Idle && !link.scratch.requested {
                continue;
            }
            self.drive(slot, now_ms, central, directory, None, sink);
        }
    }

    /// Force a link through Closing.
    pub fn close_link(
        &mut self,
        slot: usize,
        now_ms: u64,
        central: &mut impl BleCentral,
        sink: &mut impl EventSink,
    ) {
        self.drive(slot, now_ms, central, &mut NoDirectory, Some(StateId::Closing), sink);
    }

    fn drive(
        &mut self,
        slot: usize,
        now_ms: u64,
        central: &mut dyn BleCentral,
        directory: &mut dyn DirectoryPort,
        force: Option<StateId>,
        sink: &mut impl EventSink,
    ) {
        let Self {
            config,
            registry,
            links,
            arbiter,
            ..
        } = self;
        let Some(link) = links.get_mut(slot) else {
            return;
        };
        let mut ctx = LinkContext {
            now_ms,
            slot,
            config,
            registry,
            arbiter: *arbiter,
            central,
            directory,
            scratch: &mut link.scratch,
        };
        let moved = match force {
            Some(next) => link.fsm.force_transition(next, &mut ctx),
            None => link.fsm.tick(&mut ctx),
        };
        if let Some((from, to)) = moved {
            sink.emit(&HubEvent::LinkChanged { slot, from, to });
        }
    }

    // ── Telemetry ─────────────────────────────────────────────

    /// Decode one notification and run it through the pipeline.  Only
    /// links in `Subscribed` deliver data.
    pub fn handle_notification(
        &mut self,
        notification: &Notification,
        now_ms: u64,
        reset: &mut impl ResetPort,
        sink: &mut impl EventSink,
    ) -> Option<Processed> {
        let Some(slot) = self.registry.find_by_handle(notification.handle) else {
            debug!("fleet: notification for unknown handle {}", notification.handle.0);
            return None;
        };
        if self.links[slot].state() != StateId::Subscribed {
            debug!("fleet: slot {slot} not subscribed, notification dropped");
            return None;
        }
        let id = self.registry.slot(slot)?.id.clone()?;

        let payload = match notification.source {
            NotifySource::Data => match SensorReading::decode(&notification.bytes) {
                Ok(reading) => TelemetryPayload::from_reading(id, &reading),
                Err(e) => {
                    error!("fleet: bad notification from {id}: {e}");
                    return None;
                }
            },
            NotifySource::Battery => {
                let Some(&level) = notification.bytes.first() else {
                    warn!("fleet: empty battery notification from {id}");
                    return None;
                };
                // Device-level index: fanned out to every in-use sensor.
                let index = self.registry.max_sensors() as u8;
                TelemetryPayload::reading(id, index, SensorType::Battery, u32::from(level))
            }
        };

        let processed = self
            .pipeline
            .process(&mut self.registry, self.outbox, payload, now_ms)
            .ok()?;
        if processed.reset_requested() {
            self.request_reset(ResetReason::HealthCounter, reset, sink);
        }
        if processed.sensor_type == SensorType::Presence && !processed.hand_offs.is_empty() {
            self.presence
                .settle(&mut self.registry, processed.slot, processed.smartthings_ok(), now_ms);
        }
        Some(processed)
    }

    /// Periodic presence sweep.  Returns how many emissions were made.
    pub fn presence_sweep(
        &mut self,
        now_ms: u64,
        reset: &mut impl ResetPort,
        sink: &mut impl EventSink,
    ) -> usize {
        let emissions = self.presence.sweep(&mut self.registry, now_ms);
        for emission in &emissions {
            let hand_off = self
                .pipeline
                .emit_presence(&mut self.registry, self.outbox, emission, now_ms);
            sink.emit(&HubEvent::PresenceChanged {
                slot: emission.slot,
                presence: emission.presence,
            });
            self.presence
                .settle(&mut self.registry, emission.slot, !hand_off.smartthings_failed, now_ms);
            if hand_off.reset {
                self.request_reset(ResetReason::HealthCounter, reset, sink);
            }
        }
        emissions.len()
    }

    // ── Housekeeping ──────────────────────────────────────────

    /// Log the device table and prune at most one silent device.
    pub fn housekeeping(
        &mut self,
        now_ms: u64,
        central: &mut impl BleCentral,
        sink: &mut impl EventSink,
    ) -> Option<usize> {
        for line in self.registry.report() {
            info!("{line}");
        }

        let slot = self
            .registry
            .prune_candidate(now_ms, self.config.device_timeout_ms)?;
        let id = self.registry.slot(slot)?.id.clone()?;
        if let Err(Error::LinkOpen) = self.registry.delete(slot) {
            self.close_link(slot, now_ms, central, sink);
            self.registry.delete(slot).ok()?;
        }
        info!("fleet: pruned {id} from slot {slot}");
        sink.emit(&HubEvent::DevicePruned { slot, id });
        Some(slot)
    }

    // ── Device commands ───────────────────────────────────────

    /// Ask a subscribed device to re-send one sensor value.
    pub fn request_attribute_update(
        &mut self,
        id: &DeviceId,
        sensor_index: u8,
        central: &mut impl BleCentral,
    ) -> Result<()> {
        self.send_command(id, DeviceCommand::RefreshAttribute(sensor_index), central)
    }

    /// Reboot a subscribed device into its firmware-update loader.
    pub fn request_dfu(&mut self, id: &DeviceId, central: &mut impl BleCentral) -> Result<()> {
        self.send_command(id, DeviceCommand::EnterDfu, central)
    }

    fn send_command(&mut self, id: &DeviceId, cmd: DeviceCommand, central: &mut impl BleCentral) -> Result<()> {
        let slot = self
            .registry
            .lookup_index(id)
            .ok_or(ProtocolError::UnknownDevice)?;
        if self.links[slot].state() != StateId::Subscribed {
            return Err(TransportError::Disconnected.into());
        }
        let handle = self
            .registry
            .slot(slot)
            .and_then(|d| d.connection)
            .and_then(|c| c.handle)
            .ok_or(TransportError::Disconnected)?;
        let gatt = self.config.gatt;
        central.write(handle, gatt.service, gatt.config, &cmd.to_bytes())?;
        debug!("fleet: {cmd:?} sent to {id}");
        Ok(())
    }

    // ── Reset ─────────────────────────────────────────────────

    fn request_reset(&self, reason: ResetReason, reset: &mut impl ResetPort, sink: &mut impl EventSink) {
        error!("fleet: requesting device reset ({reason:?})");
        sink.emit(&HubEvent::ResetRequested(reason));
        reset.reset(reason);
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn outbox(&self) -> &'a Outbox {
        self.outbox
    }

    pub fn arbiter(&self) -> &'a Arbiter {
        self.arbiter
    }

    pub fn link_state(&self, slot: usize) -> Option<StateId> {
        self.links[..self.registry.capacity()].get(slot).map(Link::state)
    }

    pub fn scan_failures(&self) -> u8 {
        self.scan.failures()
    }

    fn lock_of(&self, slot: usize) -> Option<LockId> {
        self.registry.slot(slot).and_then(|d| d.connection).map(|c| c.lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl EventSink for Quiet {
        fn emit(&mut self, _event: &HubEvent) {}
    }

    #[test]
    fn rejects_invalid_config() {
        let arbiter = Arbiter::new();
        let cfg = FleetConfig {
            max_links: 0,
            ..FleetConfig::default()
        };
        let outbox = Outbox::new(&cfg);
        assert!(FleetService::new(cfg, &arbiter, &outbox).is_err());
    }

    #[test]
    fn start_loads_static_devices() {
        let arbiter = Arbiter::new();
        let mut cfg = FleetConfig::default();
        cfg.static_devices
            .push(heapless::String::try_from("c4:7c:8d:6a:1f:02").unwrap())
            .unwrap();
        let outbox = Outbox::new(&cfg);
        let mut fleet = FleetService::new(cfg, &arbiter, &outbox).unwrap();
        fleet.start(0, &mut Quiet);
        assert_eq!(fleet.registry().in_use_count(), 1);
        assert_eq!(fleet.link_state(0), Some(StateId::Idle));
        assert_eq!(fleet.link_state(7), None);
    }
}
