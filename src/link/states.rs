//! Concrete link-state handlers and table builder.
//!
//! ```text
//!  IDLE ──[requested + lock held]──▶ PENDING_CONNECT ──[connected]──▶ AUTHENTICATING
//!    ▲                                      │                              │
//!    │                                   [fail]                        [Success]
//!    │                                      ▼                              ▼
//!    └──────────────────────────────── CLOSING ◀──[fail / watchdog]── CONFIGURING
//!                                           ▲                              │
//!                                           │                          [all steps]
//!                                           └──────[link lost]──── SUBSCRIBED ◀┘
//! ```
//!
//! Every failure path goes through `Closing`, which disconnects, releases
//! the arbiter lock and resets `auth`, in that order.

use log::{error, info, warn};

use super::context::{ConfigStep, LinkContext};
use super::{StateDescriptor, StateId};
use crate::app::events::NotifySource;
use crate::app::ports::ConfigLookup;
use crate::config::BleUuid;
use crate::error::{Error, ProtocolError, TransportError};
use crate::registry::AuthState;
use crate::sensor::{DeviceCommand, RemoteConfig, SensorType};

// ═══════════════════════════════════════════════════════════════════════════
//  Table builder
// ═══════════════════════════════════════════════════════════════════════════

pub fn build_state_table() -> [StateDescriptor; StateId::COUNT] {
    [
        StateDescriptor {
            id: StateId::Idle,
            name: "Idle",
            on_enter: Some(idle_enter),
            on_exit: None,
            on_update: idle_update,
        },
        StateDescriptor {
            id: StateId::PendingConnect,
            name: "PendingConnect",
            on_enter: Some(pending_enter),
            on_exit: None,
            on_update: pending_update,
        },
        StateDescriptor {
            id: StateId::Authenticating,
            name: "Authenticating",
            on_enter: None,
            on_exit: None,
            on_update: authenticating_update,
        },
        StateDescriptor {
            id: StateId::Configuring,
            name: "Configuring",
            on_enter: Some(configuring_enter),
            on_exit: None,
            on_update: configuring_update,
        },
        StateDescriptor {
            id: StateId::Subscribed,
            name: "Subscribed",
            on_enter: Some(subscribed_enter),
            on_exit: Some(subscribed_exit),
            on_update: subscribed_update,
        },
        StateDescriptor {
            id: StateId::Closing,
            name: "Closing",
            on_enter: Some(closing_enter),
            on_exit: None,
            on_update: closing_update,
        },
    ]
}

/// Shared watchdog check for the handshake states.
fn watchdog_fired(ctx: &mut LinkContext<'_>) -> bool {
    if ctx.scratch.timer.expired(ctx.now_ms) {
        warn!("link {}: conn timer expired, closing", ctx.slot);
        ctx.fail(TransportError::Timeout.into());
        return true;
    }
    false
}

// ═══════════════════════════════════════════════════════════════════════════
//  IDLE
// ═══════════════════════════════════════════════════════════════════════════

fn idle_enter(ctx: &mut LinkContext) {
    ctx.scratch.timer.stop();
    ctx.scratch.step = ConfigStep::Probe;
}

fn idle_update(ctx: &mut LinkContext) -> Option<StateId> {
    if !ctx.scratch.requested {
        return None;
    }
    ctx.scratch.requested = false;
    if !ctx.lock_held() {
        error!("link {}: connect requested without holding the lock", ctx.slot);
        return None;
    }
    Some(StateId::PendingConnect)
}

// ═══════════════════════════════════════════════════════════════════════════
//  PENDING_CONNECT
// ═══════════════════════════════════════════════════════════════════════════

fn pending_enter(ctx: &mut LinkContext) {
    ctx.scratch.failure = None;
    ctx.scratch.step = ConfigStep::Probe;
    if !ctx.scratch.timer.arm(ctx.now_ms, ctx.config.connect_watchdog_ms) {
        warn!("link {}: failed to start conn timer", ctx.slot);
    }
}

fn pending_update(ctx: &mut LinkContext) -> Option<StateId> {
    if watchdog_fired(ctx) {
        return Some(StateId::Closing);
    }
    if !ctx.lock_held() {
        ctx.fail(Error::ArbitrationTimeout);
        return Some(StateId::Closing);
    }
    let Some(id) = ctx.device_id() else {
        ctx.fail(ProtocolError::UnknownDevice.into());
        return Some(StateId::Closing);
    };

    if let Err(e) = negotiate(ctx) {
        ctx.fail(e);
        return Some(StateId::Closing);
    }

    if let Some(conn) = ctx.connection_mut() {
        conn.auth = AuthState::Pending;
    }
    info!("link {}: connecting to {id}", ctx.slot);
    match ctx.central.connect(&id) {
        Ok(handle) => {
            if let Some(conn) = ctx.connection_mut() {
                conn.handle = Some(handle);
            }
            Some(StateId::Authenticating)
        }
        Err(e) => {
            ctx.fail(e.into());
            Some(StateId::Closing)
        }
    }
}

/// Ask the directory for the sensor layout of a device that has none yet.
fn negotiate(ctx: &mut LinkContext) -> Result<(), Error> {
    if !ctx.directory.enabled() {
        return Ok(());
    }
    let Some(device) = ctx.device() else {
        return Err(ProtocolError::UnknownDevice.into());
    };
    if device.sensors[0].in_use {
        return Ok(());
    }
    let Some(id) = device.id.clone() else {
        return Err(ProtocolError::UnknownDevice.into());
    };

    match ctx.directory.get_config(&id) {
        Ok(ConfigLookup::Found(kinds)) => {
            let now = ctx.now_ms;
            let slot = ctx.slot;
            for kind in kinds {
                if ctx.registry.add_sensor(slot, kind).is_none() {
                    warn!("link {slot}: directory sensor {} does not fit", kind.name());
                }
            }
            if let Some(d) = ctx.device_mut() {
                d.last_seen = now;
            }
            Ok(())
        }
        Ok(ConfigLookup::NotFound) => {
            let kind = ctx.config.static_sensor_type;
            let created = if ctx.config.create_static_devices && kind != SensorType::None {
                info!("link {}: creating {id} in directory", ctx.slot);
                ctx.directory.create_device(&id, kind)
                    && ctx.registry.add_sensor(ctx.slot, kind).is_some()
            } else {
                info!("link {}: initialising {id} as a new device", ctx.slot);
                ctx.directory.init_device(&id)
            };
            if created { Ok(()) } else { Err(Error::Directory) }
        }
        Err(e) => {
            warn!("link {}: directory: {e}", ctx.slot);
            Err(Error::Directory)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  AUTHENTICATING
// ═══════════════════════════════════════════════════════════════════════════

fn authenticating_update(ctx: &mut LinkContext) -> Option<StateId> {
    if watchdog_fired(ctx) {
        return Some(StateId::Closing);
    }
    match ctx.connection().map(|c| c.auth) {
        Some(AuthState::Pending) => None,
        Some(AuthState::Success) => Some(StateId::Configuring),
        Some(AuthState::Failed) => {
            ctx.fail(TransportError::ConnectFailed.into());
            Some(StateId::Closing)
        }
        Some(AuthState::None) | None => {
            ctx.fail(TransportError::Disconnected.into());
            Some(StateId::Closing)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  CONFIGURING
// ═══════════════════════════════════════════════════════════════════════════

fn configuring_enter(ctx: &mut LinkContext) {
    ctx.scratch.step = ConfigStep::Probe;
}

/// One configuration step per tick so the watchdog can cut in between.
fn configuring_update(ctx: &mut LinkContext) -> Option<StateId> {
    if watchdog_fired(ctx) {
        return Some(StateId::Closing);
    }
    let Some(handle) = ctx.handle().filter(|_| ctx.connection().is_some_and(|c| c.auth == AuthState::Success))
    else {
        ctx.fail(TransportError::Disconnected.into());
        return Some(StateId::Closing);
    };

    match configure_step(ctx, handle) {
        Ok(ConfigStep::Done) => Some(StateId::Subscribed),
        Ok(next) => {
            ctx.scratch.step = next;
            None
        }
        Err(e) => {
            ctx.fail(e);
            Some(StateId::Closing)
        }
    }
}

fn configure_step(ctx: &mut LinkContext, handle: crate::registry::LinkHandle) -> Result<ConfigStep, Error> {
    let gatt = ctx.config.gatt;
    match ctx.scratch.step {
        ConfigStep::Probe => {
            if gatt.service.is_none() {
                return Ok(ConfigStep::Done);
            }
            if !gatt.presence.is_none() && ctx.central.has_service(handle, gatt.presence) {
                return Ok(ConfigStep::SubscribeBattery);
            }
            if !ctx.central.has_service(handle, gatt.service) {
                return Err(TransportError::MissingService.into());
            }
            if gatt.config.is_none() {
                return Ok(ConfigStep::Subscribe);
            }
            Ok(ConfigStep::ReadVersion)
        }

        ConfigStep::SubscribeBattery => {
            let primary = ctx.device().map_or(SensorType::None, |d| d.primary_sensor());
            if primary != SensorType::Presence {
                error!("link {}: device config is not a presence sensor", ctx.slot);
                return Err(ProtocolError::SensorMismatch {
                    index: 0,
                    expected: SensorType::Presence.id(),
                    got: primary.id(),
                }
                .into());
            }
            ctx.central.subscribe(
                handle,
                BleUuid::BATTERY_SERVICE,
                BleUuid::BATTERY_LEVEL,
                NotifySource::Battery,
            )?;
            Ok(ConfigStep::Done)
        }

        ConfigStep::ReadVersion => {
            if !gatt.version.is_none() {
                let raw = ctx.central.read(handle, gatt.service, gatt.version)?;
                let word = RemoteConfig::from_le_bytes(&raw).ok_or(TransportError::ReadFailed)?;
                if let Some(d) = ctx.device_mut() {
                    d.set_version_word(word.0);
                }
            }
            if let Some(available) = ctx.config.dfu_min_version {
                let needed = ctx
                    .device()
                    .is_some_and(|d| d.update_needed(available, ctx.config.dfu_hw_rev));
                if needed {
                    match ctx
                        .central
                        .write(handle, gatt.service, gatt.config, &DeviceCommand::EnterDfu.to_bytes())
                    {
                        Ok(()) => {
                            info!("link {}: sent enter-dfu", ctx.slot);
                            return Err(ProtocolError::FirmwareUpdate.into());
                        }
                        Err(e) => error!("link {}: failed to send enter-dfu: {e}", ctx.slot),
                    }
                }
            }
            Ok(ConfigStep::Negotiate)
        }

        ConfigStep::Negotiate => {
            let raw = ctx.central.read(handle, gatt.service, gatt.config)?;
            let record = RemoteConfig::from_le_bytes(&raw).ok_or(TransportError::ReadFailed)?;
            if record.is_unconfigured() {
                let sensors = ctx.device().map(|d| d.sensors).unwrap_or_default();
                let ours = RemoteConfig::encode(&sensors);
                if !ours.is_unconfigured() {
                    info!("link {}: sending config 0x{:08x}", ctx.slot, ours.0);
                    ctx.central
                        .write(handle, gatt.service, gatt.config, &ours.to_le_bytes())?;
                }
            } else if ctx.config.adopt_remote_config {
                let slot = ctx.slot;
                for (i, kind) in record.sensor_types().into_iter().enumerate() {
                    let Some(kind) = kind else { continue };
                    let free = ctx.device().is_some_and(|d| d.sensors.get(i).is_some_and(|s| !s.in_use));
                    if free {
                        info!("link {slot}: adopting sensor type {} at {i}", kind.name());
                        ctx.registry.add_sensor(slot, kind);
                    }
                }
            }
            Ok(ConfigStep::Subscribe)
        }

        ConfigStep::Subscribe => {
            if gatt.data.is_none() {
                return Ok(ConfigStep::Done);
            }
            ctx.central
                .subscribe(handle, gatt.service, gatt.data, NotifySource::Data)?;
            Ok(ConfigStep::Done)
        }

        ConfigStep::Done => Ok(ConfigStep::Done),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  SUBSCRIBED
// ═══════════════════════════════════════════════════════════════════════════

fn subscribed_enter(ctx: &mut LinkContext) {
    ctx.scratch.timer.stop();
    ctx.scratch.failure = None;
    if let Some(conn) = ctx.connection_mut() {
        conn.record_success();
    }
    // Handshake done: other devices may use the radio again.
    if let Some(lock) = ctx.lock() {
        ctx.arbiter.give(lock);
    }
    if let Some(id) = ctx.device_id() {
        info!("link {}: {id} subscribed", ctx.slot);
    }
}

fn subscribed_exit(ctx: &mut LinkContext) {
    info!("link {}: leaving subscribed", ctx.slot);
}

fn subscribed_update(ctx: &mut LinkContext) -> Option<StateId> {
    let up = ctx
        .connection()
        .is_some_and(|c| c.handle.is_some() && c.auth == AuthState::Success);
    if up { None } else { Some(StateId::Closing) }
}

// ═══════════════════════════════════════════════════════════════════════════
//  CLOSING
// ═══════════════════════════════════════════════════════════════════════════

fn closing_enter(ctx: &mut LinkContext) {
    ctx.scratch.timer.stop();
    ctx.scratch.requested = false;

    if let Some(handle) = ctx.handle() {
        if let Err(e) = ctx.central.disconnect(handle) {
            warn!("link {}: disconnect: {e}", ctx.slot);
        }
    }

    let now = ctx.now_ms;
    let failure = ctx.scratch.failure.take();
    if let Some(conn) = ctx.connection_mut() {
        conn.handle = None;
        conn.auth = AuthState::None;
        if failure.is_some() {
            conn.record_failure(now);
        }
    }
    // Released only after the transport is down.
    if let Some(lock) = ctx.lock() {
        ctx.arbiter.give(lock);
    }
    if let Some(e) = failure {
        let retries = ctx.connection().map_or(0, |c| c.retry_count);
        warn!("link {}: attempt failed ({e}), retries {retries}", ctx.slot);
    }
}

fn closing_update(_ctx: &mut LinkContext) -> Option<StateId> {
    Some(StateId::Idle)
}
