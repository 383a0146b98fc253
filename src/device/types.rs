use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use serde::Serialize;
use uuid::Uuid;

use crate::device::constants::SIMULATED_PERIPHERAL_ID;
use crate::error::FailureReason;

/// Connection status owned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting {
        target_id: String,
    },
    Connected {
        session_id: u64,
        is_simulated: bool,
    },
    Disconnecting,
    Failed(FailureReason),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Scanning => write!(f, "Scanning…"),
            ConnectionState::Connecting { target_id } => write!(f, "Connecting to {}…", target_id),
            ConnectionState::Connected { is_simulated: false, .. } => write!(f, "Connected"),
            ConnectionState::Connected { is_simulated: true, .. } => write!(f, "Connected (simulated)"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting…"),
            ConnectionState::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

/// A peripheral seen during the current scan cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub discovered_at: SystemTime,
}

impl DiscoveredPeripheral {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown Device")
    }
}

/// One color reading. Channels are always within [0, 255] because they can only be built from
/// `u8` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorSample {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub captured_at: SystemTime,
}

impl ColorSample {
    pub fn new(r: u8, g: u8, b: u8, captured_at: SystemTime) -> Self {
        ColorSample { r, g, b, captured_at }
    }

    pub fn channels(&self) -> (u8, u8, u8) {
        (self.r, self.g, self.b)
    }

    pub fn hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// The GATT endpoint carrying color telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub services: Vec<Uuid>,
}

/// A live association with a peripheral, as returned by a transport after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub peripheral_id: String,
    pub is_simulated: bool,
}

impl Session {
    pub fn real(peripheral_id: impl Into<String>) -> Self {
        Session { peripheral_id: peripheral_id.into(), is_simulated: false }
    }

    pub fn simulated() -> Self {
        Session { peripheral_id: SIMULATED_PERIPHERAL_ID.to_string(), is_simulated: true }
    }
}

/// Items on a subscribed characteristic stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(Vec<u8>),
    Disconnected,
}

/// Ordered notifications pushed to observers, in the order the state machine applied them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StateChange(ConnectionState),
    Sample(ColorSample),
    Error(FailureReason),
    ErrorCleared,
}

/// Immutable copy of everything the state machine exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub state: ConnectionState,
    pub latest_sample: Option<ColorSample>,
    pub last_error: Option<FailureReason>,
    pub is_simulated: bool,
    pub discovered: Arc<Vec<DiscoveredPeripheral>>,
    pub discovered_version: u64,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        DeviceSnapshot {
            state: ConnectionState::Idle,
            latest_sample: None,
            last_error: None,
            is_simulated: false,
            discovered: Arc::new(Vec::new()),
            discovered_version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_upper_case_and_padded() {
        let sample = ColorSample::new(12, 200, 5, SystemTime::UNIX_EPOCH);
        assert_eq!(sample.hex(), "#0CC805");
    }

    #[test]
    fn unnamed_peripheral_has_placeholder_name() {
        let peripheral = DiscoveredPeripheral {
            id: "AA:BB".to_string(),
            name: None,
            rssi: Some(-60),
            discovered_at: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(peripheral.display_name(), "Unknown Device");
    }

    #[test]
    fn failed_state_displays_reason() {
        let state = ConnectionState::Failed(FailureReason::PermissionDenied);
        assert_eq!(state.to_string(), "Failed: Bluetooth permission was denied");
    }
}
