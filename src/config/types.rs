use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use uuid::Uuid;

use crate::device::constants::{
    make_color_characteristic_uuid, make_color_service_uuid, BOND_DELAY, COLOR_CHARACTERISTIC,
    COLOR_SERVICE, DEVICE_NAME, SCAN_TIMEOUT, SIM_CONNECT_DELAY, SIM_DISCOVERY_DELAY,
    SIM_SAMPLE_PERIOD, TEARDOWN_DEADLINE,
};
use crate::device::types::GattTarget;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// btleplug if a radio is available, the simulation otherwise
    Auto,
    Btleplug,
    Bluest,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationSettings {
    pub discovery_delay_ms: u64,
    pub connect_delay_ms: u64,
    pub sample_period_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        SimulationSettings {
            discovery_delay_ms: SIM_DISCOVERY_DELAY,
            connect_delay_ms: SIM_CONNECT_DELAY,
            sample_period_ms: SIM_SAMPLE_PERIOD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub device_name: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub scan_timeout_ms: u64,
    pub bond_delay_ms: u64,
    pub transport: TransportKind,
    pub simulation: SimulationSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: DEVICE_NAME.to_string(),
            service_uuid: COLOR_SERVICE.to_string(),
            characteristic_uuid: COLOR_CHARACTERISTIC.to_string(),
            scan_timeout_ms: SCAN_TIMEOUT,
            bond_delay_ms: BOND_DELAY,
            transport: TransportKind::Auto,
            simulation: SimulationSettings::default(),
        }
    }
}

/// Validated settings for the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSettings {
    pub target_name: String,
    pub gatt: GattTarget,
    pub scan_timeout: Duration,
    pub teardown_deadline: Duration,
}

impl Default for MachineSettings {
    fn default() -> Self {
        MachineSettings {
            target_name: DEVICE_NAME.to_string(),
            gatt: GattTarget {
                service: make_color_service_uuid(),
                characteristic: make_color_characteristic_uuid(),
            },
            scan_timeout: Duration::from_millis(SCAN_TIMEOUT),
            teardown_deadline: Duration::from_millis(TEARDOWN_DEADLINE),
        }
    }
}

impl Config {
    pub fn machine_settings(&self) -> Result<MachineSettings, ConfigError> {
        let service = Uuid::parse_str(&self.service_uuid)
            .map_err(|source| ConfigError::InvalidUuid { field: "serviceUuid", source })?;
        let characteristic = Uuid::parse_str(&self.characteristic_uuid)
            .map_err(|source| ConfigError::InvalidUuid { field: "characteristicUuid", source })?;

        Ok(MachineSettings {
            target_name: self.device_name.clone(),
            gatt: GattTarget { service, characteristic },
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
            teardown_deadline: Duration::from_millis(TEARDOWN_DEADLINE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{ "transport": "simulated", "simulation": { "samplePeriodMs": 500 } }"#).unwrap();

        assert_eq!(config.transport, TransportKind::Simulated);
        assert_eq!(config.device_name, DEVICE_NAME);
        assert_eq!(config.simulation.sample_period_ms, 500);
        assert_eq!(config.simulation.discovery_delay_ms, SIM_DISCOVERY_DELAY);
    }

    #[test]
    fn default_settings_use_known_uuids() {
        let settings = Config::default().machine_settings().unwrap();

        assert_eq!(settings.gatt.service, make_color_service_uuid());
        assert_eq!(settings.gatt.characteristic, make_color_characteristic_uuid());
        assert_eq!(settings.scan_timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_uuid_is_reported_with_its_field() {
        let config = Config { characteristic_uuid: "not-a-uuid".to_string(), ..Config::default() };

        match config.machine_settings() {
            Err(ConfigError::InvalidUuid { field, .. }) => assert_eq!(field, "characteristicUuid"),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
