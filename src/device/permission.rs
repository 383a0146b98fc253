use async_trait::async_trait;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Checks (and if needed asks for) the capability to scan and connect.
///
/// Implementations must not cache a denial: every call asks again.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check_and_request(&self) -> PermissionStatus;
}

/// Permission gate for the btleplug backend.
///
/// Desktop platforms prompt for bluetooth access the first time the radio is touched, so the
/// request is made by enumerating the adapters and checking whether the platform refused.
pub struct BtlePermissionGate;

#[async_trait]
impl PermissionGate for BtlePermissionGate {
    async fn check_and_request(&self) -> PermissionStatus {
        let manager = match Manager::new().await {
            Ok(manager) => manager,
            Err(btleplug::Error::PermissionDenied) => {
                warn!("Bluetooth access was denied");
                return PermissionStatus::Denied;
            },
            Err(err) => {
                // not a permission problem; the scan itself will report it
                warn!("Could not create bluetooth manager while checking permission: {:?}", err);
                return PermissionStatus::Granted;
            },
        };

        match manager.adapters().await {
            Err(btleplug::Error::PermissionDenied) => {
                warn!("Bluetooth access was denied");
                PermissionStatus::Denied
            },
            Err(err) => {
                warn!("Could not list bluetooth adapters while checking permission: {:?}", err);
                PermissionStatus::Granted
            },
            Ok(_) => {
                info!("Bluetooth access granted");
                PermissionStatus::Granted
            },
        }
    }
}

/// A gate with a fixed answer. Used for the simulation, which needs no radio access.
pub struct StaticPermissionGate(pub PermissionStatus);

#[async_trait]
impl PermissionGate for StaticPermissionGate {
    async fn check_and_request(&self) -> PermissionStatus {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_gate_answers_every_time() {
        let gate = StaticPermissionGate(PermissionStatus::Denied);
        assert_eq!(gate.check_and_request().await, PermissionStatus::Denied);
        assert_eq!(gate.check_and_request().await, PermissionStatus::Denied);

        let gate = StaticPermissionGate(PermissionStatus::Granted);
        assert_eq!(gate.check_and_request().await, PermissionStatus::Granted);
    }
}
