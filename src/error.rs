use std::any::Any;
use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid UUID for {field} in config file: {source}")]
    InvalidUuid { field: &'static str, source: uuid::Error },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start application (runtime): {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to write output: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Failed to store sample: {source}")]
    CollectionError { #[from] source: CollectionError },

    #[error("{reason}")]
    SessionFailed { reason: FailureReason },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[cfg(feature = "bluest")]
    #[error("Error communicating with device (bluest): {source}")]
    Bluest { #[from] source: bluest::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Bluetooth is turned off")]
    RadioOff,

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("Peripheral {id} was not seen during the current scan")]
    UnknownPeripheral { id: String },

    #[error("{operation} took too long")]
    Timeout { operation: &'static str },

    #[error("The connection state machine is no longer running")]
    Closed,
}

impl DeviceError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            DeviceError::Btle { source: btleplug::Error::PermissionDenied } => true,
            #[cfg(feature = "bluest")]
            DeviceError::Bluest { source } => source.kind() == bluest::error::ErrorKind::NotAuthorized,
            _ => false,
        }
    }
}

/// User visible reason attached to `ConnectionState::Failed` and to unexpected disconnects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("Bluetooth permission was denied")]
    PermissionDenied,

    #[error("Device not found. Make sure the color detector is powered on.")]
    NotFound,

    #[error("Failed to connect: {0}")]
    ConnectError(String),

    #[error("Device disconnected")]
    UnexpectedDisconnect,

    #[error("Bluetooth is turned off")]
    RadioOff,

    #[error("Failed to scan: {0}")]
    ScanError(String),
}

impl FailureReason {
    pub fn from_scan_error(error: &DeviceError) -> Self {
        if error.is_permission_denied() {
            return FailureReason::PermissionDenied;
        }

        match error {
            DeviceError::RadioOff => FailureReason::RadioOff,
            other => FailureReason::ScanError(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    #[error("No collection with id {id}")]
    UnknownCollection { id: String },

    #[error("No entry {entry_id} in collection {collection_id}")]
    UnknownEntry { collection_id: String, entry_id: String },
}

/// Why a frame was dropped. Never surfaced to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,

    #[error("payload is not valid utf-8")]
    NotText,

    #[error("expected 3 channels, found {found}")]
    MissingChannels { found: usize },

    #[error("token {token:?} is not a channel tag")]
    MalformedTag { token: String },

    #[error("token {token:?} is not an integer")]
    InvalidNumber { token: String },

    #[error("channel {channel} value {value} is outside [0, 255]")]
    OutOfRange { channel: char, value: i64 },
}

pub fn readable_thread_panic_error(error: &Box<dyn Any + Send + 'static>) -> String {
    let mut stringified = String::from("???");

    if let Some(s) = error.downcast_ref::<&str>() {
        stringified = format!("{}", s);
    }
    else if let Some(s) = error.downcast_ref::<String>() {
        stringified = format!("{}", s);
    }

    format!("panic from task: [{}]", stringified)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_scan_error_maps_to_permission_reason() {
        let error = DeviceError::Btle { source: btleplug::Error::PermissionDenied };
        assert_eq!(FailureReason::from_scan_error(&error), FailureReason::PermissionDenied);
    }

    #[test]
    fn radio_off_scan_error_maps_to_radio_reason() {
        assert_eq!(FailureReason::from_scan_error(&DeviceError::RadioOff), FailureReason::RadioOff);
    }

    #[test]
    fn other_scan_errors_keep_their_message() {
        let reason = FailureReason::from_scan_error(&DeviceError::NoAdapter);
        assert_eq!(reason, FailureReason::ScanError("No bluetooth adapter is available".to_string()));
    }

    #[cfg(feature = "bluest")]
    #[test]
    fn refused_bluest_scan_maps_to_permission_reason() {
        let refused = DeviceError::from(bluest::Error::from(bluest::error::ErrorKind::NotAuthorized));
        assert_eq!(FailureReason::from_scan_error(&refused), FailureReason::PermissionDenied);

        let busy = DeviceError::from(bluest::Error::from(bluest::error::ErrorKind::AlreadyScanning));
        assert!(matches!(FailureReason::from_scan_error(&busy), FailureReason::ScanError(_)));
    }
}
