//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter     | Implements    | Connects to                      |
//! |-------------|---------------|----------------------------------|
//! | `esp_ble`   | BleCentral    | Bluedroid GATT client / sim      |
//! | `http_sink` | DeliveryPort  | HTTP client / log                |
//! | `log_sink`  | EventSink     | Serial log output                |
//! | `reset`     | ResetPort     | `esp_restart` / recorder         |
//! | `time`      | -             | ESP32 system timer               |

pub mod esp_ble;
pub mod http_sink;
pub mod log_sink;
pub mod reset;
pub mod time;
