//! Inter-task channels.
//!
//! `embassy-sync` bounded channels bridge the BLE stack's callback
//! context with the executor tasks.  The radio side only ever calls the
//! non-blocking `post_*` helpers, so it never waits on the collector.
//!
//! ```text
//! ┌──────────────┐  Advertised     ┌──────────────┐  DeviceId (1)  ┌─────────────┐
//! │  BLE stack   │───────────────▶│              │──────────────▶│ connect task│
//! │  callbacks   │  link events    │  event task  │               └─────────────┘
//! │              │───────────────▶│              │
//! │              │  Notification   ├──────────────┤
//! │              │───────────────▶│ notify task  │
//! └──────────────┘                 └──────────────┘
//! ```
//!
//! Advertisements have a channel of their own so a burst of scan results
//! can only ever crowd out other advertisements, never a disconnect.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use futures_lite::future;
use log::{debug, error, warn};

use crate::app::events::{Notification, ResetReason, TransportEvent};
use crate::registry::{DeviceId, MAX_DEVICES};

pub const ADVERT_DEPTH: usize = 8;

/// Every slot may have an auth result and a disconnect in flight, plus
/// the end of a scan window.
pub const LINK_EVENT_DEPTH: usize = 2 * MAX_DEVICES + 1;

/// Hard ceiling; `FleetConfig::notify_queue_depth` applies below it.
pub const NOTIFY_DEPTH: usize = 8;

/// Scan results: BLE stack → event task.  Dropped when full.
pub static ADVERTS: Channel<CriticalSectionRawMutex, TransportEvent, ADVERT_DEPTH> = Channel::new();

/// Auth results, disconnects and scan completion: BLE stack → event task.
pub static LINK_EVENTS: Channel<CriticalSectionRawMutex, TransportEvent, LINK_EVENT_DEPTH> = Channel::new();

/// One yielded address at a time: event task → connect task.
pub static FOUND: Channel<CriticalSectionRawMutex, DeviceId, 1> = Channel::new();

/// Characteristic notifications: BLE stack → notify task.
pub static NOTIFICATIONS: Channel<CriticalSectionRawMutex, Notification, NOTIFY_DEPTH> = Channel::new();

/// The current scan window is over (stopped or completed).
pub static SCAN_DONE: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// A delivery thread asks the collector to reset the device.
pub static RESET_REQUEST: Signal<CriticalSectionRawMutex, ResetReason> = Signal::new();

/// Route a transport event to its channel without blocking.
pub fn post_event(event: TransportEvent) -> bool {
    if matches!(event, TransportEvent::Advertised(_)) {
        if ADVERTS.try_send(event).is_err() {
            debug!("channels: advertisement queue full, dropping");
            return false;
        }
        return true;
    }
    if LINK_EVENTS.try_send(event).is_err() {
        error!("channels: link event queue full, dropping");
        return false;
    }
    true
}

/// Next transport event.  Link events are served before advertisements.
pub async fn next_event() -> TransportEvent {
    future::or(LINK_EVENTS.receive(), ADVERTS.receive()).await
}

/// Post a notification unless `depth` are already waiting.
pub fn post_notification(notification: Notification, depth: usize) -> bool {
    if NOTIFICATIONS.len() >= depth.min(NOTIFY_DEPTH) || NOTIFICATIONS.try_send(notification).is_err() {
        warn!("channels: notification queue full, dropping");
        return false;
    }
    true
}

/// Hand an address to the connect task.  Only one may be pending.
pub fn post_found(id: DeviceId) -> bool {
    if FOUND.try_send(id).is_err() {
        warn!("channels: connection already pending, address dropped");
        return false;
    }
    true
}
