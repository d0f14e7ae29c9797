//! Scan coordinator: admission control in front of discovery.
//!
//! ```text
//!   start() ──[in_use >= max_links]──▶ Skipped   (no lock touched)
//!      │
//!      ├──[a lock is held]────────────▶ Failed
//!      └──[central.scan_start ok]─────▶ Started
//!
//!   advertisement ─▶ backoff gate ─▶ UUID match ─▶ allowlist ─▶ DeviceId
//! ```

use log::{debug, error, info, warn};

use crate::app::events::Advertisement;
use crate::app::ports::BleCentral;
use crate::arbiter::Arbiter;
use crate::config::{BleUuid, FleetConfig};
use crate::registry::{DeviceId, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStart {
    Started,
    /// Too many devices already; nothing was attempted.
    Skipped,
    Failed,
}

pub struct ScanCoordinator {
    max_links: usize,
    fail_threshold: u8,
    failures: u8,
    service: BleUuid,
    presence: BleUuid,
    allow_dynamic: bool,
    retry_threshold: u8,
    backoff_unit_ms: u32,
}

impl ScanCoordinator {
    pub fn new(config: &FleetConfig) -> Self {
        Self {
            max_links: usize::from(config.max_links),
            fail_threshold: config.scan_fail_threshold,
            failures: 0,
            service: config.gatt.service,
            presence: config.gatt.presence,
            allow_dynamic: config.allow_dynamic_devices,
            retry_threshold: config.retry_threshold,
            backoff_unit_ms: config.backoff_unit_ms,
        }
    }

    /// Room for another link?
    pub fn admit(&self, registry: &Registry) -> bool {
        registry.in_use_count() < self.max_links
    }

    /// Start one discovery window.  The caller is expected to have waited
    /// for the arbiter to drain; a held lock here counts as a failure.
    pub fn start(&mut self, registry: &Registry, arbiter: &Arbiter, central: &mut dyn BleCentral) -> ScanStart {
        if !self.admit(registry) {
            info!("scan: max clients reached ({}), skipping", self.max_links);
            return ScanStart::Skipped;
        }
        if !arbiter.all_free() {
            warn!("scan: arbiter busy");
            return ScanStart::Failed;
        }
        match central.scan_start() {
            Ok(()) => {
                debug!("scan: started");
                ScanStart::Started
            }
            Err(e) => {
                warn!("scan: start failed: {e}");
                ScanStart::Failed
            }
        }
    }

    /// Account for a start attempt.  Returns `true` when consecutive
    /// failures have passed the threshold and the device should reset.
    pub fn record(&mut self, result: ScanStart) -> bool {
        match result {
            ScanStart::Started => {
                self.failures = 0;
                false
            }
            ScanStart::Skipped => false,
            ScanStart::Failed => {
                let prev = self.failures;
                self.failures = self.failures.saturating_add(1);
                if prev > self.fail_threshold {
                    error!("scan: {} consecutive start failures", self.failures);
                    return true;
                }
                false
            }
        }
    }

    pub fn failures(&self) -> u8 {
        self.failures
    }

    /// Filter one advertisement.  `Some` means stop scanning and hand the
    /// address to the connection manager.
    pub fn on_advertisement(&self, adv: &Advertisement, registry: &Registry, now_ms: u64) -> Option<DeviceId> {
        let id = DeviceId::from_addr(adv.addr);
        let known = registry.lookup(&id);

        if let Some(conn) = known.and_then(|s| s.connection) {
            if conn.retry_count > 0 && !conn.may_attempt(now_ms, self.retry_threshold, self.backoff_unit_ms) {
                debug!("scan: {id} ignored, backing off");
                return None;
            }
        }

        let wanted = adv
            .uuids
            .iter()
            .any(|u| (!self.service.is_none() && *u == self.service) || (!self.presence.is_none() && *u == self.presence));
        if !wanted {
            return None;
        }

        if known.is_none() && !self.allow_dynamic {
            info!("scan: {id} unknown, ignoring");
            return None;
        }
        Some(id)
    }
}
