//! Alternate transport backed by bluest. Enabled with the `bluest` cargo feature.
//!
//! bluest streams borrow the adapter or characteristic they come from, so each stream is driven
//! by a spawned task that owns its source and forwards items over a channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use async_trait::async_trait;
use bluest::{Adapter, Device};
use futures::channel::mpsc::channel;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{CONNECT_DEADLINE, EVENT_CHANNEL_CAPACITY};
use crate::device::transport::{DiscoveryStream, LinkStream, Transport};
use crate::device::types::{DiscoveredPeripheral, DiscoveryFilter, GattTarget, LinkEvent, Session};
use crate::error::DeviceError;

pub struct BluestTransport {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    scan_cancel: Mutex<Option<CancellationToken>>,
    bond_delay: Duration,
}

impl BluestTransport {
    pub async fn new(bond_delay_ms: u64) -> Result<Self, DeviceError> {
        let adapter = Adapter::default().await.ok_or(DeviceError::NoAdapter)?;

        Ok(BluestTransport {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            scan_cancel: Mutex::new(None),
            bond_delay: Duration::from_millis(bond_delay_ms),
        })
    }

    fn lookup(&self, peripheral_id: &str) -> Result<Device, DeviceError> {
        let devices = self.devices.lock().expect("Failed to lock device map");
        let device = devices.get(peripheral_id).cloned();
        device.ok_or_else(|| DeviceError::UnknownPeripheral { id: peripheral_id.to_string() })
    }
}

#[async_trait]
impl Transport for BluestTransport {
    fn name(&self) -> &'static str {
        "bluest"
    }

    async fn capability_available(&self) -> bool {
        match timeout(Duration::from_millis(CONNECT_DEADLINE), self.adapter.wait_available()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!("Bluetooth adapter is not usable: {:?}", err);
                false
            },
            Err(_) => {
                warn!("Bluetooth adapter did not become available");
                false
            },
        }
    }

    async fn start_discovery(&self, filter: &DiscoveryFilter) -> Result<DiscoveryStream, DeviceError> {
        self.devices.lock().expect("Failed to lock device map").clear();

        let cancel = CancellationToken::new();
        if let Some(previous) = self.scan_cancel.lock().expect("Failed to lock scan token").replace(cancel.clone()) {
            previous.cancel();
        }

        let (mut tx, rx) = channel::<DiscoveredPeripheral>(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), DeviceError>>();
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let services = filter.services.clone();

        spawn(async move {
            let mut scan = match adapter.scan(&services).await {
                Ok(scan) => {
                    let _ = ready_tx.send(Ok(()));
                    scan
                },
                Err(err) => {
                    let _ = ready_tx.send(Err(err.into()));
                    return;
                },
            };
            info!("Scanning for services {:?}...", services);

            'scanloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'scanloop;
                    },
                    found = scan.next() => {
                        let Some(found) = found else { break 'scanloop };
                        let discovered = DiscoveredPeripheral {
                            id: found.device.id().to_string(),
                            name: found.adv_data.local_name.clone(),
                            rssi: found.rssi,
                            discovered_at: SystemTime::now(),
                        };

                        devices
                            .lock()
                            .expect("Failed to lock device map")
                            .insert(discovered.id.clone(), found.device);

                        if tx.send(discovered).await.is_err() {
                            break 'scanloop;
                        }
                    },
                }
            }

            debug!("Scan task stopped");
        });

        // report a refused scan to the caller instead of ending the stream silently
        ready_rx.await.map_err(|_| DeviceError::Closed)??;
        Ok(rx.boxed())
    }

    async fn stop_discovery(&self) -> Result<(), DeviceError> {
        if let Some(cancel) = self.scan_cancel.lock().expect("Failed to lock scan token").take() {
            info!("Stopping scan");
            cancel.cancel();
        }
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<Session, DeviceError> {
        let device = self.lookup(peripheral_id)?;

        info!("Connecting to peripheral {}...", peripheral_id);
        timeout(Duration::from_millis(CONNECT_DEADLINE), self.adapter.connect_device(&device))
            .await
            .map_err(|_| DeviceError::Timeout { operation: "Connecting to peripheral" })??;

        sleep(self.bond_delay).await;

        Ok(Session::real(peripheral_id))
    }

    async fn subscribe(&self, session: &Session, target: &GattTarget) -> Result<LinkStream, DeviceError> {
        let device = self.lookup(&session.peripheral_id)?;

        let mut characteristic = None;
        for service in device.discover_services_with_uuid(target.service).await? {
            if let Some(found) = service
                .discover_characteristics_with_uuid(target.characteristic)
                .await?
                .into_iter()
                .next()
            {
                characteristic = Some(found);
                break;
            }
        }
        let characteristic = characteristic.ok_or(DeviceError::MissingCharacteristic)?;

        let (mut tx, rx) = channel::<LinkEvent>(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), DeviceError>>();

        spawn(async move {
            let mut notifications = match characteristic.notify().await {
                Ok(notifications) => {
                    let _ = ready_tx.send(Ok(()));
                    notifications
                },
                Err(err) => {
                    let _ = ready_tx.send(Err(err.into()));
                    return;
                },
            };

            while let Some(notification) = notifications.next().await {
                let event = match notification {
                    Ok(value) => LinkEvent::Frame(value),
                    Err(err) => {
                        warn!("Error in notification stream: {:?}", err);
                        break;
                    },
                };

                if tx.send(event).await.is_err() {
                    return;
                }
            }

            // the notification stream ends when the link is lost
            let _ = tx.send(LinkEvent::Disconnected).await;
        });

        ready_rx.await.map_err(|_| DeviceError::Closed)??;
        info!("Subscribed to characteristic {:?} {:?}", target.service, target.characteristic);

        Ok(rx.boxed())
    }

    async fn disconnect(&self, session: &Session) -> Result<(), DeviceError> {
        let device = self.lookup(&session.peripheral_id)?;

        if device.is_connected().await {
            info!("Disconnecting from peripheral {}", session.peripheral_id);
            self.adapter.disconnect_device(&device).await?;
        }

        Ok(())
    }
}
