use std::sync::Arc;
use async_trait::async_trait;
use futures::stream::BoxStream;
use log::{info, warn};

use crate::config::types::{SimulationSettings, TransportKind};
use crate::device::btle::BtleTransport;
use crate::device::permission::{BtlePermissionGate, PermissionGate, PermissionStatus, StaticPermissionGate};
use crate::device::types::{DiscoveredPeripheral, DiscoveryFilter, GattTarget, LinkEvent, Session};
use crate::error::DeviceError;
use crate::sim::simulated_transport::SimulatedTransport;

pub type DiscoveryStream = BoxStream<'static, DiscoveredPeripheral>;

/// Frames from the subscribed characteristic. `LinkEvent::Disconnected` (or the end of the
/// stream) means the link was lost.
pub type LinkStream = BoxStream<'static, LinkEvent>;

/// Boundary to a radio stack. The connection state machine only talks to this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probed once at startup; false means this backend cannot be used.
    async fn capability_available(&self) -> bool;

    async fn start_discovery(&self, filter: &DiscoveryFilter) -> Result<DiscoveryStream, DeviceError>;

    async fn stop_discovery(&self) -> Result<(), DeviceError>;

    async fn connect(&self, peripheral_id: &str) -> Result<Session, DeviceError>;

    async fn subscribe(&self, session: &Session, target: &GattTarget) -> Result<LinkStream, DeviceError>;

    async fn disconnect(&self, session: &Session) -> Result<(), DeviceError>;
}

/// A transport together with the permission gate that guards it.
#[derive(Clone)]
pub struct Backend {
    pub transport: Arc<dyn Transport>,
    pub gate: Arc<dyn PermissionGate>,
}

impl Backend {
    pub fn simulated(target_name: &str, settings: SimulationSettings) -> Self {
        Backend {
            transport: Arc::new(SimulatedTransport::new(target_name, settings)),
            gate: Arc::new(StaticPermissionGate(PermissionStatus::Granted)),
        }
    }
}

async fn btleplug_backend(bond_delay_ms: u64) -> Result<Backend, DeviceError> {
    let transport = BtleTransport::new(bond_delay_ms).await?;
    if !transport.capability_available().await {
        return Err(DeviceError::NoAdapter);
    }

    Ok(Backend {
        transport: Arc::new(transport),
        gate: Arc::new(BtlePermissionGate),
    })
}

#[cfg(feature = "bluest")]
async fn bluest_backend(bond_delay_ms: u64) -> Result<Backend, DeviceError> {
    let transport = crate::device::bluest::BluestTransport::new(bond_delay_ms).await?;
    if !transport.capability_available().await {
        return Err(DeviceError::NoAdapter);
    }

    Ok(Backend {
        transport: Arc::new(transport),
        gate: Arc::new(StaticPermissionGate(PermissionStatus::Granted)),
    })
}

#[cfg(not(feature = "bluest"))]
async fn bluest_backend(_bond_delay_ms: u64) -> Result<Backend, DeviceError> {
    warn!("This build does not include the bluest backend");
    Err(DeviceError::NoAdapter)
}

/// Pick the backend for this process.
///
/// `Auto` prefers btleplug and falls back to the simulation when no radio is bound or the
/// radio fails to initialize. An explicitly configured radio backend does not fall back.
pub async fn select_backend(
    kind: TransportKind,
    target_name: &str,
    bond_delay_ms: u64,
    simulation: SimulationSettings,
) -> Result<Backend, DeviceError> {
    let backend = match kind {
        TransportKind::Simulated => Backend::simulated(target_name, simulation),
        TransportKind::Btleplug => btleplug_backend(bond_delay_ms).await?,
        TransportKind::Bluest => bluest_backend(bond_delay_ms).await?,
        TransportKind::Auto => match btleplug_backend(bond_delay_ms).await {
            Ok(backend) => backend,
            Err(err) => {
                warn!("Bluetooth is not available ({}); running in simulation mode", err);
                Backend::simulated(target_name, simulation)
            },
        },
    };

    info!("Using {} transport", backend.transport.name());
    Ok(backend)
}
