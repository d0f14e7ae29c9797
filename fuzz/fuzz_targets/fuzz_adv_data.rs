//! Fuzz target: advertising-data parser
//!
//! `parse_adv_uuids` runs inside the radio callback on raw bytes from
//! any nearby advertiser.
//!
//! Invariants checked:
//! - No panics under any byte sequence
//! - Never more UUIDs than `MAX_ADV_UUIDS`
//!
//! cargo fuzz run fuzz_adv_data

#![no_main]

use libfuzzer_sys::fuzz_target;
use sensorhub::adapters::esp_ble::parse_adv_uuids;
use sensorhub::app::events::MAX_ADV_UUIDS;

fuzz_target!(|data: &[u8]| {
    let uuids = parse_adv_uuids(data);
    assert!(uuids.len() <= MAX_ADV_UUIDS);
});
