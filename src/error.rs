/// Error taxonomy for the correlator.
///
/// Sensor-facing boundaries return [`MalformedInput`] and the caller discards
/// the record. Device and sink errors are retried. Only store write
/// exhaustion and a bad registry are fatal.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A sensor line or advertisement payload that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedInput {
    #[error("line is not valid UTF-8")]
    NotUtf8,
    #[error("line does not start with a known SSID prefix")]
    UnknownPrefix,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid MAC address `{0}`")]
    BadMac(String),
    #[error("invalid timestamp `{0}`")]
    BadTimestamp(String),
    #[error("SSID longer than 32 bytes")]
    SsidTooLong,
    #[error("advertisement record is not manufacturer data (type 0x{0:02X})")]
    NotManufacturerData(u8),
    #[error("payload too short ({0} bytes)")]
    PayloadTooShort(usize),
    #[error("payload is not a JSON record")]
    NotJson,
    #[error("invalid hex in advertisement feed")]
    BadHex,
}

/// A sensor device could not be opened or read.
#[derive(Debug, Error)]
#[error("device {device} unavailable: {source}")]
pub struct DeviceUnavailable {
    pub device: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("store write failed after {attempts} attempts: {source}")]
    WriteFailed {
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("store record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store is closed")]
    Closed,
}

/// Failure reported by a notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// 5xx, timeout, connection refused. Worth retrying.
    #[error("transient sink failure: {0}")]
    Transient(String),
    /// 4xx or a request the sink will never accept.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl NotifyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("registry line {line}: {reason}")]
    Record { line: usize, reason: String },
}
