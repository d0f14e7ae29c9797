//! sensorhub collector: main entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  BluedroidCentral  HttpSink ×2   LogEventSink   SystemReset    │
//! │  (BleCentral)      (Delivery)    (EventSink)    (ResetPort)    │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │              FleetService (pure logic)                 │    │
//! │  │  Registry · Links · Presence · Pipeline · Scan         │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  runtime: edge-executor tasks + embassy-sync channels          │
//! └────────────────────────────────────────────────────────────────┘
//! ```

#![deny(unused_must_use)]

use anyhow::{Result, anyhow};
use log::info;

use sensorhub::adapters::esp_ble::BluedroidCentral;
use sensorhub::adapters::http_sink::HttpSink;
use sensorhub::adapters::log_sink::LogEventSink;
use sensorhub::adapters::reset::SystemReset;
use sensorhub::app::ports::NoDirectory;
use sensorhub::config::FleetConfig;
use sensorhub::runtime;

const INFLUX_URL: &str = match option_env!("SENSORHUB_INFLUX_URL") {
    Some(url) => url,
    None => "http://influxdb.local:8086/write?db=sensors&precision=ms",
};

const EVENTS_URL: &str = match option_env!("SENSORHUB_EVENTS_URL") {
    Some(url) => url,
    None => "http://hub.local:8080/devices",
};

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  sensorhub v{}                       ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Configuration ──────────────────────────────────────
    let config = FleetConfig::default();
    config.validate()?;
    info!(
        "Fleet: {} devices x {} sensors, {} concurrent links",
        config.max_devices, config.max_sensors, config.max_links
    );

    // ── 3. Adapters ───────────────────────────────────────────
    let central = BluedroidCentral::new(usize::from(config.notify_queue_depth))
        .map_err(|e| anyhow!("BLE init failed: {e}"))?;
    let influx = HttpSink::influx(INFLUX_URL);
    let events = HttpSink::events(EVENTS_URL, option_env!("SENSORHUB_EVENTS_TOKEN"));

    // ── 4. Run until reset ────────────────────────────────────
    runtime::run(
        config,
        central,
        NoDirectory,
        SystemReset::new(),
        LogEventSink::new(),
        influx,
        events,
    )?;
    Ok(())
}
