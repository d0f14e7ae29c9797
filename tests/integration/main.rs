//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises the collector against
//! mock adapters.  All tests run on the host (x86_64) with no radio
//! required.

mod fleet_tests;
mod mock_ble;
mod scenario_tests;
