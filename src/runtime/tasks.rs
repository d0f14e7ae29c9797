//! Long-lived collector tasks on a single `edge-executor`, plus one
//! delivery thread per destination.
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────────┐
//!  │  futures_lite::block_on                                        │
//!  │  ┌──────────────────────────────────────────────────────────┐  │
//!  │  │  edge_executor::LocalExecutor                            │  │
//!  │  │                                                          │  │
//!  │  │  scan      events     connect    links 50ms⏱            │  │
//!  │  │  notify    presence⏱ housekeep⏱ reset                  │  │
//!  │  └──────────────────────────────────────────────────────────┘  │
//!  └────────────────────────────────────────────────────────────────┘
//!  deliver-influx ─┐
//!  deliver-events ─┴─ own threads, see [`delivery`](super::delivery)
//! ```
//!
//! Tasks share the [`Hub`] through `Rc`; `RefCell` borrows never span
//! an `.await`.  Delivery threads see only the `'static` [`Outbox`] and
//! report resets back through `RESET_REQUEST`.

use core::cell::RefCell;
use core::time::Duration;
use std::rc::Rc;

use async_io_mini::Timer;
use edge_executor::LocalExecutor;
use futures_lite::future;
use log::{error, info, warn};

use super::channels::{FOUND, NOTIFICATIONS, RESET_REQUEST, SCAN_DONE, next_event, post_found};
use super::delivery;
use crate::adapters::time::MonotonicClock;
use crate::app::events::{HubEvent, ResetReason, TransportEvent};
use crate::app::ports::{BleCentral, DeliveryPort, DirectoryPort, EventSink, ResetPort};
use crate::app::service::FleetService;
use crate::arbiter::Arbiter;
use crate::config::FleetConfig;
use crate::error::{Error, Result};
use crate::scan::ScanStart;
use crate::telemetry::Outbox;

/// Link state machines are ticked at this period.
pub const LINK_POLL_MS: u64 = 50;

/// Pause between scan windows.
const SCAN_REST_MS: u64 = 1_000;

/// Everything the domain tasks share.
pub struct Hub<C, D, R, S> {
    pub fleet: RefCell<FleetService<'static>>,
    pub central: RefCell<C>,
    pub directory: RefCell<D>,
    pub reset: RefCell<R>,
    pub sink: RefCell<S>,
    pub clock: MonotonicClock,
}

impl<C, D, R, S> Hub<C, D, R, S>
where
    R: ResetPort,
    S: EventSink,
{
    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn reset_device(&self, reason: ResetReason) {
        error!("runtime: requesting device reset ({reason:?})");
        self.sink.borrow_mut().emit(&HubEvent::ResetRequested(reason));
        self.reset.borrow_mut().reset(reason);
    }
}

// ── Scan ─────────────────────────────────────────────────────

/// Wait for every link to leave its handshake, then open a scan window
/// and park until it ends.
async fn scan_loop<C, D, R, S>(hub: Rc<Hub<C, D, R, S>>)
where
    C: BleCentral,
    R: ResetPort,
    S: EventSink,
{
    let (arbiter, lock_timeout) = {
        let fleet = hub.fleet.borrow();
        (
            fleet.arbiter(),
            Duration::from_millis(u64::from(fleet.config().lock_timeout_ms)),
        )
    };
    loop {
        if !arbiter.wait_all_free(lock_timeout).await {
            warn!("scan: links still busy after {}ms", lock_timeout.as_millis());
        }
        SCAN_DONE.reset();
        let started = hub.fleet.borrow_mut().start_scan(
            &mut *hub.central.borrow_mut(),
            &mut *hub.reset.borrow_mut(),
            &mut *hub.sink.borrow_mut(),
        );
        if started == ScanStart::Started {
            SCAN_DONE.wait().await;
        }
        Timer::after(Duration::from_millis(SCAN_REST_MS)).await;
    }
}

// ── Transport events ─────────────────────────────────────────

async fn event_loop<C, D, R, S>(hub: Rc<Hub<C, D, R, S>>)
where
    C: BleCentral,
{
    loop {
        let event = next_event().await;
        let now = hub.clock.now_ms();
        let found = hub
            .fleet
            .borrow_mut()
            .handle_transport_event(&event, now, &mut *hub.central.borrow_mut());
        if let Some(id) = found {
            post_found(id);
            SCAN_DONE.signal(());
        } else if event == TransportEvent::ScanComplete {
            SCAN_DONE.signal(());
        }
    }
}

// ── Connection manager ───────────────────────────────────────

/// Admit each yielded address, take its lock, hand it to its link.
async fn connect_loop<C, D, R, S>(hub: Rc<Hub<C, D, R, S>>)
where
    C: BleCentral,
    R: ResetPort,
    S: EventSink,
{
    let (arbiter, lock_timeout) = {
        let fleet = hub.fleet.borrow();
        (
            fleet.arbiter(),
            Duration::from_millis(u64::from(fleet.config().lock_timeout_ms)),
        )
    };
    loop {
        let id = FOUND.receive().await;
        let admitted = hub.fleet.borrow_mut().admit(
            &id,
            hub.now_ms(),
            &mut *hub.central.borrow_mut(),
            &mut *hub.sink.borrow_mut(),
        );
        let (slot, lock) = match admitted {
            Ok(found) => found,
            Err(e) => {
                warn!("connect: {id}: {e}");
                continue;
            }
        };
        if arbiter.take(lock, lock_timeout).await {
            hub.fleet.borrow_mut().begin_link(slot);
        } else {
            hub.fleet.borrow_mut().lock_timed_out(slot, hub.now_ms());
        }
    }
}

async fn link_loop<C, D, R, S>(hub: Rc<Hub<C, D, R, S>>)
where
    C: BleCentral,
    D: DirectoryPort,
    S: EventSink,
{
    loop {
        hub.fleet.borrow_mut().poll_links(
            hub.clock.now_ms(),
            &mut *hub.central.borrow_mut(),
            &mut *hub.directory.borrow_mut(),
            &mut *hub.sink.borrow_mut(),
        );
        Timer::after(Duration::from_millis(LINK_POLL_MS)).await;
    }
}

// ── Notifications ────────────────────────────────────────────

async fn notify_loop<C, D, R, S>(hub: Rc<Hub<C, D, R, S>>)
where
    R: ResetPort,
    S: EventSink,
{
    loop {
        let notification = NOTIFICATIONS.receive().await;
        hub.fleet.borrow_mut().handle_notification(
            &notification,
            hub.now_ms(),
            &mut *hub.reset.borrow_mut(),
            &mut *hub.sink.borrow_mut(),
        );
    }
}

// ── Periodic ─────────────────────────────────────────────────

async fn presence_loop<C, D, R, S>(hub: Rc<Hub<C, D, R, S>>)
where
    R: ResetPort,
    S: EventSink,
{
    let period = Duration::from_millis(u64::from(hub.fleet.borrow().config().presence_sweep_ms));
    loop {
        Timer::after(period).await;
        hub.fleet.borrow_mut().presence_sweep(
            hub.now_ms(),
            &mut *hub.reset.borrow_mut(),
            &mut *hub.sink.borrow_mut(),
        );
    }
}

async fn housekeeping_loop<C, D, R, S>(hub: Rc<Hub<C, D, R, S>>)
where
    C: BleCentral,
    S: EventSink,
{
    let period = Duration::from_millis(u64::from(
        hub.fleet.borrow().config().housekeeping_interval_ms,
    ));
    loop {
        Timer::after(period).await;
        hub.fleet.borrow_mut().housekeeping(
            hub.clock.now_ms(),
            &mut *hub.central.borrow_mut(),
            &mut *hub.sink.borrow_mut(),
        );
    }
}

// ── Reset requests ───────────────────────────────────────

/// Reset requests from the delivery threads land here.
async fn reset_loop<C, D, R, S>(hub: Rc<Hub<C, D, R, S>>)
where
    R: ResetPort,
    S: EventSink,
{
    loop {
        let reason = RESET_REQUEST.wait().await;
        hub.reset_device(reason);
    }
}

// ── Entry point ──────────────────────────────────────────────

/// Build the service, start it and run every task until reset.
#[allow(clippy::too_many_arguments)]
pub fn run<C, D, R, S, I, T>(
    config: FleetConfig,
    central: C,
    directory: D,
    reset: R,
    mut sink: S,
    influx: I,
    smartthings: T,
) -> Result<()>
where
    C: BleCentral + 'static,
    D: DirectoryPort + 'static,
    R: ResetPort + 'static,
    S: EventSink + 'static,
    I: DeliveryPort + Send + 'static,
    T: DeliveryPort + Send + 'static,
{
    let arbiter: &'static Arbiter = Box::leak(Box::new(Arbiter::new()));
    let outbox: &'static Outbox = Box::leak(Box::new(Outbox::new(&config)));
    let clock = MonotonicClock::new();

    let mut fleet = FleetService::new(config, arbiter, outbox)?;
    fleet.start(clock.now_ms(), &mut sink);

    let hub = Rc::new(Hub {
        fleet: RefCell::new(fleet),
        central: RefCell::new(central),
        directory: RefCell::new(directory),
        reset: RefCell::new(reset),
        sink: RefCell::new(sink),
        clock,
    });

    let executor: LocalExecutor<'_, 16> = LocalExecutor::new();
    executor.spawn(scan_loop(hub.clone())).detach();
    executor.spawn(event_loop(hub.clone())).detach();
    executor.spawn(connect_loop(hub.clone())).detach();
    executor.spawn(link_loop(hub.clone())).detach();
    executor.spawn(notify_loop(hub.clone())).detach();
    executor.spawn(presence_loop(hub.clone())).detach();
    executor.spawn(housekeeping_loop(hub.clone())).detach();
    executor.spawn(reset_loop(hub)).detach();

    delivery::spawn("deliver-influx\0", &outbox.influx, &outbox.health, influx).map_err(|e| {
        error!("runtime: influx consumer: {e}");
        Error::Spawn
    })?;
    delivery::spawn("deliver-events\0", &outbox.smartthings, &outbox.health, smartthings).map_err(|e| {
        error!("runtime: event consumer: {e}");
        Error::Spawn
    })?;

    info!("runtime: collector tasks started");
    future::block_on(executor.run(core::future::pending::<()>()));
    Ok(())
}
