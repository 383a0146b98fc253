use uuid::Uuid;

/**
 * How long (milliseconds) a scan may run before giving up on finding the target device.
 */
pub const SCAN_TIMEOUT: u64 = 10_000;

/**
 * How long (milliseconds) to wait after connecting before discovering services, so that the
 * peripheral can finish bonding.
 */
pub const BOND_DELAY: u64 = 900;

/**
 * How long (milliseconds) connecting to the peripheral may take.
 */
pub const CONNECT_DEADLINE: u64 = 10_000;

/**
 * How long (milliseconds) discovering the services of a connected peripheral may take.
 */
pub const DISCOVER_SERVICES_DEADLINE: u64 = 15_000;

/**
 * How long (milliseconds) stopping a scan or disconnecting may take before the transport is
 * considered released anyway.
 */
pub const TEARDOWN_DEADLINE: u64 = 2000;

/**
 * Simulation: delay (milliseconds) between starting a scan and "discovering" the device.
 */
pub const SIM_DISCOVERY_DELAY: u64 = 2000;

/**
 * Simulation: delay (milliseconds) between "discovering" the device and being connected.
 */
pub const SIM_CONNECT_DELAY: u64 = 1000;

/**
 * Simulation: how often (milliseconds) a new random color sample is emitted.
 */
pub const SIM_SAMPLE_PERIOD: u64 = 2000;

/**
 * Capacity of the channel that carries transport events to the connection state machine.
 */
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/**
 * The advertised name of the color detector, used to auto-connect during a scan.
 */
pub const DEVICE_NAME: &str = "Surface Color Detector";

/**
 * The UUID of the Bluetooth BLE service of the color detector
 */
pub const COLOR_SERVICE: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";

/**
 * The UUID of the Bluetooth BLE remote GATT characteristic that notifies color readings.
 */
pub const COLOR_CHARACTERISTIC: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";

/**
 * Peripheral identifier used for sessions created by the simulation.
 */
pub const SIMULATED_PERIPHERAL_ID: &str = "simulated";

pub fn make_color_service_uuid() -> Uuid {
    Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b)
}

pub fn make_color_characteristic_uuid() -> Uuid {
    Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_constants_agree() {
        assert_eq!(make_color_service_uuid().to_string(), COLOR_SERVICE);
        assert_eq!(make_color_characteristic_uuid().to_string(), COLOR_CHARACTERISTIC);
    }
}
