//! Mock adapters for integration tests.
//!
//! Each mock records every call so tests can assert on the full history
//! without a radio, a directory server or a network.

use heapless::Vec as HVec;
use sensorhub::app::events::{HubEvent, NotifySource, ResetReason};
use sensorhub::app::ports::{
    BleCentral, ConfigLookup, DeliveryPort, DirectoryError, DirectoryPort, EventSink, MAX_ATTR_LEN, ResetPort,
};
use sensorhub::config::{BleUuid, GattProfile};
use sensorhub::error::{DeliveryError, TransportError};
use sensorhub::registry::{DeviceId, LinkHandle};
use sensorhub::sensor::{Scopes, SensorType};
use sensorhub::telemetry::DeliveryRecord;

// ── Central call record ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum CentralCall {
    ScanStart,
    ScanStop,
    Connect(DeviceId),
    Write(LinkHandle, [u8; 4]),
    Subscribe(LinkHandle, NotifySource),
    Disconnect(LinkHandle),
}

// ── MockCentral ───────────────────────────────────────────────

/// Peripheral side is a single collector-profile device.  Reads of the
/// config characteristic return `config_word`; writes update it.
pub struct MockCentral {
    pub calls: Vec<CentralCall>,
    pub profile: GattProfile,
    pub config_word: u32,
    pub version_word: u32,
    pub service_present: bool,
    pub scan_fails: bool,
    pub connect_fails: bool,
    next_handle: u16,
}

#[allow(dead_code)]
impl MockCentral {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            profile: GattProfile::default(),
            config_word: 0,
            version_word: 0x0001_0001,
            service_present: true,
            scan_fails: false,
            connect_fails: false,
            next_handle: 1,
        }
    }

    pub fn writes(&self) -> Vec<[u8; 4]> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                CentralCall::Write(_, w) => Some(*w),
                _ => None,
            })
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<NotifySource> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                CentralCall::Subscribe(_, s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&CentralCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    /// Handle the next successful `connect` will return.
    pub fn next_handle(&self) -> LinkHandle {
        LinkHandle(self.next_handle)
    }
}

impl Default for MockCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl BleCentral for MockCentral {
    fn scan_start(&mut self) -> Result<(), TransportError> {
        self.calls.push(CentralCall::ScanStart);
        if self.scan_fails {
            Err(TransportError::ScanFailed)
        } else {
            Ok(())
        }
    }

    fn scan_stop(&mut self) {
        self.calls.push(CentralCall::ScanStop);
    }

    fn connect(&mut self, id: &DeviceId) -> Result<LinkHandle, TransportError> {
        self.calls.push(CentralCall::Connect(id.clone()));
        if self.connect_fails {
            return Err(TransportError::ConnectFailed);
        }
        let handle = LinkHandle(self.next_handle);
        self.next_handle += 1;
        Ok(handle)
    }

    fn has_service(&mut self, _handle: LinkHandle, service: BleUuid) -> bool {
        self.service_present && service == self.profile.service
    }

    fn read(
        &mut self,
        _handle: LinkHandle,
        _service: BleUuid,
        characteristic: BleUuid,
    ) -> Result<HVec<u8, MAX_ATTR_LEN>, TransportError> {
        let word = if characteristic == self.profile.config {
            self.config_word
        } else if characteristic == self.profile.version {
            self.version_word
        } else {
            return Err(TransportError::MissingCharacteristic);
        };
        Ok(HVec::from_slice(&word.to_le_bytes()).unwrap())
    }

    fn write(
        &mut self,
        handle: LinkHandle,
        _service: BleUuid,
        _characteristic: BleUuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let word: [u8; 4] = data.try_into().map_err(|_| TransportError::WriteFailed)?;
        self.calls.push(CentralCall::Write(handle, word));
        if word[..2] != [0xff, 0xff] {
            self.config_word = u32::from_le_bytes(word);
        }
        Ok(())
    }

    fn subscribe(
        &mut self,
        handle: LinkHandle,
        _service: BleUuid,
        _characteristic: BleUuid,
        source: NotifySource,
    ) -> Result<(), TransportError> {
        self.calls.push(CentralCall::Subscribe(handle, source));
        Ok(())
    }

    fn disconnect(&mut self, handle: LinkHandle) -> Result<(), TransportError> {
        self.calls.push(CentralCall::Disconnect(handle));
        Ok(())
    }
}

// ── MockDirectory ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryCall {
    GetConfig(DeviceId),
    InitDevice(DeviceId),
    CreateDevice(DeviceId, SensorType),
}

pub struct MockDirectory {
    pub calls: Vec<DirectoryCall>,
    pub answer: Result<ConfigLookup, DirectoryError>,
    pub accept: bool,
}

#[allow(dead_code)]
impl MockDirectory {
    pub fn not_found() -> Self {
        Self {
            calls: Vec::new(),
            answer: Ok(ConfigLookup::NotFound),
            accept: true,
        }
    }

    pub fn found(kinds: &[SensorType]) -> Self {
        Self {
            calls: Vec::new(),
            answer: Ok(ConfigLookup::Found(HVec::from_slice(kinds).unwrap())),
            accept: true,
        }
    }
}

impl DirectoryPort for MockDirectory {
    fn get_config(&mut self, id: &DeviceId) -> Result<ConfigLookup, DirectoryError> {
        self.calls.push(DirectoryCall::GetConfig(id.clone()));
        self.answer.clone()
    }

    fn init_device(&mut self, id: &DeviceId) -> bool {
        self.calls.push(DirectoryCall::InitDevice(id.clone()));
        self.accept
    }

    fn create_device(&mut self, id: &DeviceId, kind: SensorType) -> bool {
        self.calls.push(DirectoryCall::CreateDevice(id.clone(), kind));
        self.accept
    }
}

// ── ScriptedDelivery ──────────────────────────────────────────

/// Returns scripted results in order, then succeeds.
pub struct ScriptedDelivery {
    pub results: Vec<Result<(), DeliveryError>>,
    pub sent: Vec<DeliveryRecord>,
}

#[allow(dead_code)]
impl ScriptedDelivery {
    pub fn new(results: Vec<Result<(), DeliveryError>>) -> Self {
        Self {
            results,
            sent: Vec::new(),
        }
    }
}

impl DeliveryPort for ScriptedDelivery {
    fn send(&mut self, _scope: Scopes, record: &DeliveryRecord) -> Result<(), DeliveryError> {
        self.sent.push(record.clone());
        if self.results.is_empty() {
            Ok(())
        } else {
            self.results.remove(0)
        }
    }
}

// ── Recorders ─────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingReset {
    pub reasons: Vec<ResetReason>,
}

impl ResetPort for RecordingReset {
    fn reset(&mut self, reason: ResetReason) {
        self.reasons.push(reason);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<HubEvent>,
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &HubEvent) {
        self.events.push(event.clone());
    }
}
