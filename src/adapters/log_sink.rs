//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing structured hub events to the
//! ESP-IDF logger (UART / USB-CDC in production).  A future MQTT
//! adapter would implement the same trait.

use log::{error, info};

use crate::app::events::HubEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`HubEvent`] to the serial console.
#[derive(Debug, Default)]
pub struct LogEventSink {
    emitted: u32,
}

impl LogEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> u32 {
        self.emitted
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &HubEvent) {
        self.emitted = self.emitted.wrapping_add(1);
        match event {
            HubEvent::Started { devices } => {
                info!("START | devices={devices}");
            }
            HubEvent::DeviceCreated { slot, id } => {
                info!("DEVICE | +{id} slot={slot}");
            }
            HubEvent::DevicePruned { slot, id } => {
                info!("DEVICE | -{id} slot={slot}");
            }
            HubEvent::LinkChanged { slot, from, to } => {
                info!("LINK | slot={slot} {from:?} -> {to:?}");
            }
            HubEvent::PresenceChanged { slot, presence } => {
                info!("PRESENCE | slot={slot} {}", presence.as_str());
            }
            HubEvent::ResetRequested(reason) => {
                error!("RESET | {reason:?}");
            }
        }
    }
}
