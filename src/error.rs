//! Unified error types for the collector firmware.
//!
//! Every fallible operation funnels into [`Error`].  All variants are
//! `Copy` so they can be stored in link scratch state and logged from
//! any task without allocation.
//!
//! | Category      | Handling                                        |
//! |---------------|-------------------------------------------------|
//! | Capacity      | non-fatal, caller backs off                     |
//! | Arbitration   | retried on the next scan cycle                  |
//! | Transport     | link goes to Closing, `retry_count` increments  |
//! | Protocol      | payload dropped and logged                      |
//! | Delivery      | one requeue, then dropped with counter bump     |

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No free device, sensor or queue slot.
    Capacity(CapacityError),
    /// An arbiter lock could not be taken within its timeout.
    ArbitrationTimeout,
    /// The device is still inside its reconnect backoff window.
    Backoff,
    /// A BLE central operation failed.
    Transport(TransportError),
    /// A payload or identifier did not match the device model.
    Protocol(ProtocolError),
    /// A delivery destination rejected or never received a record.
    Delivery(DeliveryError),
    /// The device directory refused or failed negotiation.
    Directory,
    /// The device still owns an open link.
    LinkOpen,
    /// Configuration is invalid.
    Config(&'static str),
    /// A worker thread could not be started.
    Spawn,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capacity(e) => write!(f, "capacity: {e}"),
            Self::ArbitrationTimeout => write!(f, "arbiter lock timeout"),
            Self::Backoff => write!(f, "reconnect backoff in effect"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Delivery(e) => write!(f, "delivery: {e}"),
            Self::Directory => write!(f, "device directory negotiation failed"),
            Self::LinkOpen => write!(f, "device link still open"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn => write!(f, "worker thread spawn failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    NoDeviceSlot,
    NoSensorSlot,
    QueueFull,
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDeviceSlot => write!(f, "no free device slot"),
            Self::NoSensorSlot => write!(f, "no free sensor slot"),
            Self::QueueFull => write!(f, "queue full"),
        }
    }
}

impl From<CapacityError> for Error {
    fn from(e: CapacityError) -> Self {
        Self::Capacity(e)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    ScanFailed,
    ConnectFailed,
    Disconnected,
    MissingService,
    MissingCharacteristic,
    NotifyUnsupported,
    ReadFailed,
    WriteFailed,
    Timeout,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScanFailed => write!(f, "scan start failed"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::Disconnected => write!(f, "peer disconnected"),
            Self::MissingService => write!(f, "missing GATT service"),
            Self::MissingCharacteristic => write!(f, "missing GATT characteristic"),
            Self::NotifyUnsupported => write!(f, "characteristic cannot notify"),
            Self::ReadFailed => write!(f, "characteristic read failed"),
            Self::WriteFailed => write!(f, "characteristic write failed"),
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Notification shorter than index + type + one value byte.
    ShortPayload,
    /// Value width is not 1, 2 or 4 bytes.
    BadValueWidth,
    UnknownSensorType(u8),
    /// Sensor index points at a slot configured for another type.
    SensorMismatch { index: u8, expected: u8, got: u8 },
    SensorIndexOutOfRange(u8),
    UnknownDevice,
    InvalidDeviceId,
    /// Peripheral was sent into its firmware-update loader.
    FirmwareUpdate,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortPayload => write!(f, "payload too short"),
            Self::BadValueWidth => write!(f, "unsupported value width"),
            Self::UnknownSensorType(t) => write!(f, "unknown sensor type {t}"),
            Self::SensorMismatch {
                index,
                expected,
                got,
            } => write!(
                f,
                "sensor {index} is type {expected}, payload carries type {got}"
            ),
            Self::SensorIndexOutOfRange(i) => write!(f, "sensor index {i} out of range"),
            Self::UnknownDevice => write!(f, "no such device"),
            Self::InvalidDeviceId => write!(f, "malformed device id"),
            Self::FirmwareUpdate => write!(f, "peripheral entering firmware update"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Destination could not be reached (DNS, TCP, TLS, timeout).
    Unreachable,
    /// Destination answered with a non-2xx status.
    Rejected(u16),
    /// Record did not fit the serialisation buffer.
    Encode,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "destination unreachable"),
            Self::Rejected(code) => write!(f, "destination returned HTTP {code}"),
            Self::Encode => write!(f, "record encoding failed"),
        }
    }
}

impl From<DeliveryError> for Error {
    fn from(e: DeliveryError) -> Self {
        Self::Delivery(e)
    }
}

impl core::error::Error for Error {}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_errors_convert_into_error() {
        let e: Error = TransportError::ConnectFailed.into();
        assert_eq!(e, Error::Transport(TransportError::ConnectFailed));
        let e: Error = CapacityError::NoDeviceSlot.into();
        assert_eq!(e, Error::Capacity(CapacityError::NoDeviceSlot));
    }

    #[test]
    fn mismatch_display_names_both_types() {
        let e = Error::from(ProtocolError::SensorMismatch {
            index: 1,
            expected: 2,
            got: 5,
        });
        let text = format!("{e}");
        assert!(text.contains("sensor 1 is type 2"));
        assert!(text.contains("type 5"));
    }
}
