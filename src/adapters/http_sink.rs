//! Delivery sink adapters.
//!
//! | Adapter    | Target   | Sends to                                |
//! |------------|----------|-----------------------------------------|
//! | `HttpSink` | espidf   | `POST` over `esp_idf_svc::http::client` |
//! | `LogSink`  | any      | the log facade (host simulation)        |
//!
//! Neither retries; the delivery queue owns that.

use log::info;

use crate::app::ports::DeliveryPort;
use crate::error::DeliveryError;
use crate::sensor::Scopes;
use crate::telemetry::DeliveryRecord;

// ───────────────────────────────────────────────────────────────
// HTTP (target)
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub use esp_impl::HttpSink;

#[cfg(target_os = "espidf")]
mod esp_impl {
    use esp_idf_svc::http::Method;
    use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
    use esp_idf_svc::io::Write;
    use log::{debug, warn};

    use super::*;

    const TIMEOUT_MS: u64 = 5_000;

    /// One HTTP destination.  Records with an endpoint are posted to
    /// `{base}/{endpoint}`, the rest to `base` itself.
    pub struct HttpSink {
        base: String,
        content_type: &'static str,
        bearer: Option<String>,
    }

    impl HttpSink {
        /// Time-series line-protocol writer.
        pub fn influx(write_url: &str) -> Self {
            Self {
                base: write_url.to_owned(),
                content_type: "text/plain",
                bearer: None,
            }
        }

        /// Event-document endpoint.
        pub fn events(base_url: &str, token: Option<&str>) -> Self {
            Self {
                base: base_url.trim_end_matches('/').to_owned(),
                content_type: "application/json",
                bearer: token.map(|t| format!("Bearer {t}")),
            }
        }

        fn url(&self, record: &DeliveryRecord) -> String {
            if record.endpoint.is_empty() {
                self.base.clone()
            } else {
                format!("{}/{}", self.base, record.endpoint)
            }
        }
    }

    impl DeliveryPort for HttpSink {
        fn send(&mut self, scope: Scopes, record: &DeliveryRecord) -> Result<(), DeliveryError> {
            let mut conn = EspHttpConnection::new(&Configuration {
                timeout: Some(core::time::Duration::from_millis(TIMEOUT_MS)),
                ..Default::default()
            })
            .map_err(|e| {
                warn!("http: client init failed: {e}");
                DeliveryError::Unreachable
            })?;

            let len = record.body.len().to_string();
            let mut headers = heapless::Vec::<(&str, &str), 3>::new();
            let _ = headers.push(("Content-Type", self.content_type));
            let _ = headers.push(("Content-Length", len.as_str()));
            if let Some(bearer) = &self.bearer {
                let _ = headers.push(("Authorization", bearer.as_str()));
            }

            let url = self.url(record);
            conn.initiate_request(Method::Post, &url, &headers)
                .map_err(|_| DeliveryError::Unreachable)?;
            conn.write_all(record.body.as_bytes())
                .map_err(|_| DeliveryError::Unreachable)?;
            conn.initiate_response().map_err(|_| DeliveryError::Unreachable)?;

            let status = conn.status();
            debug!("http {scope:?}: {url} -> {status}");
            if (200..300).contains(&status) {
                Ok(())
            } else {
                Err(DeliveryError::Rejected(status))
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Log (host)
// ───────────────────────────────────────────────────────────────

/// Writes every record to the log and reports success.
#[derive(Debug, Default)]
pub struct LogSink {
    sent: u32,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }
}

impl DeliveryPort for LogSink {
    fn send(&mut self, scope: Scopes, record: &DeliveryRecord) -> Result<(), DeliveryError> {
        self.sent = self.sent.wrapping_add(1);
        if record.endpoint.is_empty() {
            info!("SEND {:02x} | {}", scope.bits(), record.body);
        } else {
            info!("SEND {:02x} | {} {}", scope.bits(), record.endpoint, record.body);
        }
        Ok(())
    }
}
