use std::path::PathBuf;
use clap::Parser;
use futures::channel::mpsc::channel;
use futures::StreamExt;
use log::{error, info, warn, LevelFilter};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::collections::{CollectionStore, MemoryCollectionStore};
use crate::config::io::ConfigIO;
use crate::config::types::TransportKind;
use crate::device::constants::EVENT_CHANNEL_CAPACITY;
use crate::device::machine::spawn_connection_machine;
use crate::device::transport::select_backend;
use crate::device::types::{ColorSample, ConnectionState, DeviceEvent};
use crate::error::{readable_thread_panic_error, AppRunError};

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Connects to a surface color detector and prints the colors it reads.", long_about = None)]
pub struct Args {
    /// Use this config file instead of the portable or per-user one
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Do not touch the radio, generate readings instead
    #[arg(long)]
    pub simulate: bool,

    /// Disconnect after this many readings
    #[arg(long)]
    pub samples: Option<u64>,

    /// Collect every reading into a collection with this name and print it as JSON on exit
    #[arg(long)]
    pub collection: Option<String>,

    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn log_level(&self) -> LevelFilter {
        if self.verbose { LevelFilter::Debug } else { LevelFilter::Info }
    }
}

fn sample_line(sample: &ColorSample) -> String {
    format!("{} R:{} G:{} B:{}", sample.hex(), sample.r, sample.g, sample.b)
}

async fn run_session(config_io: ConfigIO, args: Args) -> Result<(), AppRunError> {
    let mut config = config_io.read().await?;
    if args.simulate {
        config.transport = TransportKind::Simulated;
    }

    let settings = config.machine_settings()?;
    let backend = select_backend(config.transport, &config.device_name, config.bond_delay_ms, config.simulation).await?;

    // this token is cancelled upon exit
    let app_cancel = CancellationToken::new();
    let (event_tx, mut events) = channel::<DeviceEvent>(EVENT_CHANNEL_CAPACITY);
    let (handle, machine) = spawn_connection_machine(app_cancel.clone(), backend, settings, vec![event_tx]);

    let mut store = MemoryCollectionStore::new();
    let collection_id = args.collection.as_deref().map(|name| store.create_collection(name));

    let mut received: u64 = 0;
    let mut disconnect_requested = false;
    let mut failure = None;

    handle.request_scan().await?;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    'mainloop: loop {
        tokio::select! {
            result = &mut ctrl_c, if !disconnect_requested => {
                if let Err(err) = result {
                    warn!("Failed to listen for ctrl-c: {:?}", err);
                }

                info!("Interrupted");
                disconnect_requested = true;
                match handle.state() {
                    ConnectionState::Idle | ConnectionState::Failed(_) => break 'mainloop,
                    _ => handle.request_disconnect().await?,
                }
            },
            event = events.next() => match event {
                None => break 'mainloop,
                Some(DeviceEvent::StateChange(state)) => {
                    println!("{}", state);

                    match state {
                        ConnectionState::Idle => {
                            if !disconnect_requested {
                                failure = handle.snapshot().last_error;
                            }
                            break 'mainloop;
                        },
                        ConnectionState::Failed(reason) => {
                            failure = Some(reason);
                            break 'mainloop;
                        },
                        _ => {},
                    }
                },
                Some(DeviceEvent::Sample(sample)) => {
                    println!("{}", sample_line(&sample));

                    if let Some(id) = &collection_id {
                        store.append_sample(id, &sample, None)?;
                    }

                    received += 1;
                    if !disconnect_requested && args.samples.map_or(false, |limit| received >= limit) {
                        info!("Received {} samples", received);
                        disconnect_requested = true;
                        handle.request_disconnect().await?;
                    }
                },
                Some(DeviceEvent::Error(reason)) => {
                    error!("{}", reason);
                },
                Some(DeviceEvent::ErrorCleared) => {},
            },
        }
    }

    app_cancel.cancel();
    if let Err(err) = machine.await {
        if err.is_panic() {
            error!("Connection state machine stopped: {}", readable_thread_panic_error(&err.into_panic()));
        }
    }

    if let Some(collection) = collection_id.as_deref().and_then(|id| store.collection(id)) {
        println!("{}", serde_json::to_string_pretty(collection)?);
    }

    match failure {
        Some(reason) => Err(AppRunError::SessionFailed { reason }),
        None => Ok(()),
    }
}

pub fn run_application(args: Args) -> Result<(), AppRunError> {
    let mut config_io = ConfigIO::new_sync(args.config.clone())?;
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_session(config_io, args))
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;
    use super::*;

    #[test]
    fn parses_all_flags() {
        let args = Args::try_parse_from([
            "colorlink", "--config", "/tmp/colorlink.json", "--simulate", "--samples", "3",
            "--collection", "Walls", "-v",
        ]).unwrap();

        assert_eq!(args.config, Some(PathBuf::from("/tmp/colorlink.json")));
        assert!(args.simulate);
        assert_eq!(args.samples, Some(3));
        assert_eq!(args.collection.as_deref(), Some("Walls"));
        assert_eq!(args.log_level(), LevelFilter::Debug);
    }

    #[test]
    fn defaults_to_info_logging() {
        let args = Args::try_parse_from(["colorlink"]).unwrap();

        assert!(!args.simulate);
        assert_eq!(args.samples, None);
        assert_eq!(args.log_level(), LevelFilter::Info);
    }

    #[test]
    fn sample_line_shows_hex_and_channels() {
        let sample = ColorSample::new(12, 200, 5, SystemTime::UNIX_EPOCH);
        assert_eq!(sample_line(&sample), "#0CC805 R:12 G:200 B:5");
    }
}
