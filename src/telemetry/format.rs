//! Serialised record formats, one per destination.
//!
//! ```text
//!  time-series:  MOTION,device_id=c4:7c:8d:6a:1f:02,sensor_id=0 MOTION=1
//!  event doc:    c4:7c:8d:6a:1f:02-0  {"type":"MOTION","value":"active"}
//! ```

use core::fmt::Write;

use heapless::String;
use serde::Serialize;

use super::{DeliveryRecord, TelemetryPayload};
use crate::error::DeliveryError;
use crate::sensor::{SensorType, value_label};

/// Influx line protocol.
pub fn influx_line(payload: &TelemetryPayload) -> Result<DeliveryRecord, DeliveryError> {
    let mut body = String::new();
    write!(
        body,
        "{},device_id={},sensor_id={}",
        payload.sensor_type.name(),
        payload.device_id,
        payload.sensor_id
    )
    .map_err(|_| DeliveryError::Encode)?;

    for tag in &payload.tags {
        write!(body, ",{}={}", tag.key, tag.value).map_err(|_| DeliveryError::Encode)?;
    }

    for (i, attr) in payload.attributes.iter().enumerate() {
        let sep = if i == 0 { ' ' } else { ',' };
        write!(body, "{sep}{}={}", attr.name, attr.value).map_err(|_| DeliveryError::Encode)?;
    }

    Ok(DeliveryRecord {
        endpoint: String::new(),
        body,
        retried: false,
    })
}

#[derive(Serialize)]
#[serde(untagged)]
enum EventValue {
    Word(&'static str),
    Number(u32),
}

#[derive(Serialize)]
struct EventDoc<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: EventValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    capability: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attribute: Option<&'a str>,
}

/// Device-event document addressed to `{device_id}-{sensor_id}`.
pub fn event_document(payload: &TelemetryPayload) -> Result<DeliveryRecord, DeliveryError> {
    let raw = payload.value();
    let value = match value_label(payload.sensor_type, raw.min(u32::from(u16::MAX)) as u16) {
        Some(word) => EventValue::Word(word),
        None => EventValue::Number(raw),
    };
    let battery = payload.sensor_type == SensorType::Battery;
    let doc = EventDoc {
        kind: payload.sensor_type.name(),
        value,
        capability: battery.then_some("battery"),
        attribute: battery.then_some("battery"),
    };

    let json = serde_json::to_string(&doc).map_err(|_| DeliveryError::Encode)?;
    let body = String::try_from(json.as_str()).map_err(|()| DeliveryError::Encode)?;

    let mut endpoint = String::new();
    write!(endpoint, "{}-{}", payload.device_id, payload.sensor_id)
        .map_err(|_| DeliveryError::Encode)?;

    Ok(DeliveryRecord {
        endpoint,
        body,
        retried: false,
    })
}
