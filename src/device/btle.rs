use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{future, stream, StreamExt};
use log::{debug, info, warn};
use tokio::time::{sleep, timeout, Duration};

use crate::device::constants::{CONNECT_DEADLINE, DISCOVER_SERVICES_DEADLINE};
use crate::device::transport::{DiscoveryStream, LinkStream, Transport};
use crate::device::types::{DiscoveredPeripheral, DiscoveryFilter, GattTarget, LinkEvent, Session};
use crate::error::DeviceError;

type PeripheralMap = Arc<Mutex<HashMap<String, Peripheral>>>;

/// Primary transport, backed by btleplug.
pub struct BtleTransport {
    _manager: Manager,
    adapter: Adapter,
    peripherals: PeripheralMap,
    bond_delay: Duration,
}

impl BtleTransport {
    pub async fn new(bond_delay_ms: u64) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        Ok(BtleTransport {
            _manager: manager,
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            bond_delay: Duration::from_millis(bond_delay_ms),
        })
    }

    fn lookup(&self, peripheral_id: &str) -> Result<Peripheral, DeviceError> {
        let peripherals = self.peripherals.lock().expect("Failed to lock peripheral map");
        let peripheral = peripherals.get(peripheral_id).cloned();
        peripheral.ok_or_else(|| DeviceError::UnknownPeripheral { id: peripheral_id.to_string() })
    }
}

async fn describe_peripheral(adapter: &Adapter, id: &btleplug::platform::PeripheralId, peripherals: &PeripheralMap) -> Option<DiscoveredPeripheral> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            warn!("Could not look up discovered peripheral {:?}: {:?}", id, err);
            return None;
        },
    };

    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => {
            debug!("Peripheral {:?} has no properties", id);
            return None;
        },
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            return None;
        },
    };

    let discovered = DiscoveredPeripheral {
        id: peripheral.id().to_string(),
        name: properties.local_name,
        rssi: properties.rssi,
        discovered_at: SystemTime::now(),
    };

    peripherals
        .lock()
        .expect("Failed to lock peripheral map")
        .insert(discovered.id.clone(), peripheral);

    Some(discovered)
}

#[async_trait]
impl Transport for BtleTransport {
    fn name(&self) -> &'static str {
        "btleplug"
    }

    async fn capability_available(&self) -> bool {
        match self.adapter.adapter_info().await {
            Ok(_) => true,
            Err(err) => {
                warn!("Bluetooth adapter is not usable: {:?}", err);
                false
            },
        }
    }

    async fn start_discovery(&self, filter: &DiscoveryFilter) -> Result<DiscoveryStream, DeviceError> {
        if let Ok(CentralState::PoweredOff) = self.adapter.adapter_state().await {
            return Err(DeviceError::RadioOff);
        }

        self.peripherals.lock().expect("Failed to lock peripheral map").clear();

        // subscribe before starting the scan so that no discovery is missed
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter { services: filter.services.clone() }).await?;
        info!("Scanning for services {:?}...", filter.services);

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();

            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        describe_peripheral(&adapter, &id, &peripherals).await
                    },
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn stop_discovery(&self) -> Result<(), DeviceError> {
        info!("Stopping scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<Session, DeviceError> {
        let peripheral = self.lookup(peripheral_id)?;

        info!("Connecting to peripheral {}...", peripheral_id);
        timeout(Duration::from_millis(CONNECT_DEADLINE), peripheral.connect())
            .await
            .map_err(|_| DeviceError::Timeout { operation: "Connecting to peripheral" })??;

        // the peripheral needs a moment to finish bonding before its services can be read
        sleep(self.bond_delay).await;

        info!("Connected; Discovering services...");
        timeout(Duration::from_millis(DISCOVER_SERVICES_DEADLINE), peripheral.discover_services())
            .await
            .map_err(|_| DeviceError::Timeout { operation: "Discovering services" })??;

        Ok(Session::real(peripheral_id))
    }

    async fn subscribe(&self, session: &Session, target: &GattTarget) -> Result<LinkStream, DeviceError> {
        let peripheral = self.lookup(&session.peripheral_id)?;

        let characteristic = peripheral
            .services()
            .into_iter()
            .filter(|service| service.uuid == target.service)
            .flat_map(|service| service.characteristics.into_iter())
            .find(|characteristic| characteristic.uuid == target.characteristic)
            .ok_or(DeviceError::MissingCharacteristic)?;

        let notifications = peripheral.notifications().await?;
        let adapter_events = self.adapter.events().await?;

        info!("Subscribing to characteristic {:?} {:?}", target.service, target.characteristic);
        peripheral.subscribe(&characteristic).await?;

        let characteristic_uuid = target.characteristic;
        let frames = notifications.filter_map(move |notification| {
            future::ready(
                (notification.uuid == characteristic_uuid).then(|| LinkEvent::Frame(notification.value))
            )
        });

        let peripheral_id = peripheral.id();
        let disconnects = adapter_events.filter_map(move |event| {
            let lost = matches!(event, CentralEvent::DeviceDisconnected(ref id) if *id == peripheral_id);
            future::ready(lost.then_some(LinkEvent::Disconnected))
        });

        Ok(stream::select(frames, disconnects).boxed())
    }

    async fn disconnect(&self, session: &Session) -> Result<(), DeviceError> {
        let peripheral = self.lookup(&session.peripheral_id)?;

        if peripheral.is_connected().await? {
            info!("Disconnecting from peripheral {}", session.peripheral_id);
            peripheral.disconnect().await?;
        }

        Ok(())
    }
}
