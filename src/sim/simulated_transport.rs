use std::time::SystemTime;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use log::info;
use rand::Rng;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use crate::config::types::SimulationSettings;
use crate::device::constants::SIMULATED_PERIPHERAL_ID;
use crate::device::transport::{DiscoveryStream, LinkStream, Transport};
use crate::device::types::{DiscoveredPeripheral, DiscoveryFilter, GattTarget, LinkEvent, Session};
use crate::error::DeviceError;

/// Stands in for the radio when no bluetooth adapter is usable.
///
/// Reproduces the timing of a real session: the target is "discovered" after a delay, connecting
/// takes a while, and once subscribed a random color frame arrives immediately and then
/// periodically. Sessions are marked as simulated.
pub struct SimulatedTransport {
    target_name: String,
    settings: SimulationSettings,
}

impl SimulatedTransport {
    pub fn new(target_name: &str, settings: SimulationSettings) -> Self {
        SimulatedTransport {
            target_name: target_name.to_string(),
            settings,
        }
    }
}

/// Frames are produced in the key-tagged wire format, so they go through the same decoder as
/// frames from a real detector.
pub fn random_frame() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let (r, g, b): (u8, u8, u8) = (rng.gen(), rng.gen(), rng.gen());
    format!("R:{},G:{},B:{}", r, g, b).into_bytes()
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn capability_available(&self) -> bool {
        true
    }

    async fn start_discovery(&self, _filter: &DiscoveryFilter) -> Result<DiscoveryStream, DeviceError> {
        let delay = Duration::from_millis(self.settings.discovery_delay_ms);
        let name = self.target_name.clone();

        info!("Simulation: scanning");
        let found = stream::once(async move {
            sleep(delay).await;
            DiscoveredPeripheral {
                id: SIMULATED_PERIPHERAL_ID.to_string(),
                name: Some(name),
                rssi: None,
                discovered_at: SystemTime::now(),
            }
        });

        // a real scan keeps running until stopped
        Ok(found.chain(stream::pending()).boxed())
    }

    async fn stop_discovery(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<Session, DeviceError> {
        if peripheral_id != SIMULATED_PERIPHERAL_ID {
            return Err(DeviceError::UnknownPeripheral { id: peripheral_id.to_string() });
        }

        sleep(Duration::from_millis(self.settings.connect_delay_ms)).await;
        info!("Simulation: connected");
        Ok(Session::simulated())
    }

    async fn subscribe(&self, _session: &Session, _target: &GattTarget) -> Result<LinkStream, DeviceError> {
        let mut ticker = interval(Duration::from_millis(self.settings.sample_period_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // the first tick completes immediately
        let frames = stream::unfold(ticker, |mut ticker| async move {
            ticker.tick().await;
            Some((LinkEvent::Frame(random_frame()), ticker))
        });

        Ok(frames.boxed())
    }

    async fn disconnect(&self, _session: &Session) -> Result<(), DeviceError> {
        info!("Simulation: disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::decoder::decode_frame;

    fn transport() -> SimulatedTransport {
        SimulatedTransport::new("Target", SimulationSettings::default())
    }

    fn filter() -> DiscoveryFilter {
        DiscoveryFilter { services: vec![] }
    }

    #[test]
    fn random_frames_always_decode() {
        for _ in 0..200 {
            let frame = random_frame();
            assert!(decode_frame(&frame, SystemTime::UNIX_EPOCH).is_ok(), "{:?}", String::from_utf8_lossy(&frame));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discovers_target_after_delay() {
        let transport = transport();
        let started = tokio::time::Instant::now();

        let mut discovery = transport.start_discovery(&filter()).await.unwrap();
        let found = discovery.next().await.unwrap();

        assert_eq!(found.name.as_deref(), Some("Target"));
        assert_eq!(found.id, SIMULATED_PERIPHERAL_ID);
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_yields_simulated_session() {
        let session = transport().connect(SIMULATED_PERIPHERAL_ID).await.unwrap();
        assert!(session.is_simulated);

        assert!(matches!(
            transport().connect("AA:BB").await,
            Err(DeviceError::UnknownPeripheral { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_arrive_immediately_then_periodically() {
        let transport = transport();
        let target = GattTarget { service: uuid::Uuid::nil(), characteristic: uuid::Uuid::nil() };
        let mut frames = transport.subscribe(&Session::simulated(), &target).await.unwrap();
        let started = tokio::time::Instant::now();

        assert!(matches!(frames.next().await, Some(LinkEvent::Frame(_))));
        assert!(started.elapsed() < Duration::from_millis(10));

        assert!(matches!(frames.next().await, Some(LinkEvent::Frame(_))));
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }
}
