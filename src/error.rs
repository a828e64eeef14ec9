//! Error taxonomy.
//!
//! Background loops handle I/O errors locally (retry, backoff, or drop)
//! and never propagate them past their own task; these types are for the
//! errors that must surface to a caller or to the front-end as a
//! structured event.

use std::fmt;
use thiserror::Error;

/// Errors from the platform BLE driver (central or peripheral side).
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,
    #[error("scan failed to start or stop: {0}")]
    ScanFailure(String),
    #[error("connect to {address} timed out after {timeout_secs}s")]
    ConnectTimeout { address: String, timeout_secs: u64 },
    #[error("connect to {address} failed: {reason}")]
    ConnectFailure { address: String, reason: String },
    #[error("write to {address} failed: {reason}")]
    WriteFailure { address: String, reason: String },
    #[error("notify failed: {0}")]
    NotifyFailure(String),
}

/// Errors from parsing or validating a `Message`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("malformed datagram: {0}")]
    ParseError(String),
    #[error("message failed validation: {0}")]
    ValidationError(String),
    #[error("message exceeds MAX_MESSAGE_SIZE ({actual} > {limit} bytes)")]
    SizeError { actual: usize, limit: usize },
}

/// Which sliding-window bucket rejected an originate attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    Connection,
    Device,
    Global,
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitType::Connection => write!(f, "connection"),
            LimitType::Device => write!(f, "device"),
            LimitType::Global => write!(f, "global"),
        }
    }
}

/// Returned when an originate attempt exceeds a rate-limit bucket.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit exceeded ({limit_type}), retry after {retry_after_secs}s")]
pub struct RateLimitError {
    pub limit_type: LimitType,
    pub retry_after_secs: u64,
}

/// Union of everything that can cross the Handler/Supervisor boundary to the
/// front-end, carrying a `code` + human-readable `message`
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error(transparent)]
    Bluetooth(#[from] BluetoothError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

impl BeaconError {
    /// Machine-readable error code surfaced to the front-end.
    pub fn code(&self) -> &'static str {
        match self {
            BeaconError::Bluetooth(BluetoothError::AdapterUnavailable) => "adapter_unavailable",
            BeaconError::Bluetooth(BluetoothError::ScanFailure(_)) => "scan_failure",
            BeaconError::Bluetooth(BluetoothError::ConnectTimeout { .. }) => "connect_timeout",
            BeaconError::Bluetooth(BluetoothError::ConnectFailure { .. }) => "connect_failure",
            BeaconError::Bluetooth(BluetoothError::WriteFailure { .. }) => "write_failure",
            BeaconError::Bluetooth(BluetoothError::NotifyFailure(_)) => "notify_failure",
            BeaconError::Message(MessageError::ParseError(_)) => "parse_error",
            BeaconError::Message(MessageError::ValidationError(_)) => "validation_error",
            BeaconError::Message(MessageError::SizeError { .. }) => "size_error",
            BeaconError::RateLimit(_) => "rate_limit_exceeded",
        }
    }
}
