//! The connection state machine.
//!
//! A single task owns the `ConnectionState`, the current session and the discovered set. Caller
//! requests, transport callbacks and the scan timer all reach it as messages, and it applies
//! them one at a time. Every message coming from the transport is stamped with the generation
//! of the scan/session cycle it belongs to; the generation advances whenever a cycle starts or
//! ends, so late messages from an older cycle are discarded.

use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::types::MachineSettings;
use crate::device::constants::EVENT_CHANNEL_CAPACITY;
use crate::device::decoder::decode_frame;
use crate::device::permission::{PermissionGate, PermissionStatus};
use crate::device::transport::{Backend, LinkStream, Transport};
use crate::device::types::{
    ConnectionState, DeviceEvent, DeviceSnapshot, DiscoveredPeripheral, DiscoveryFilter, GattTarget,
    LinkEvent, Session,
};
use crate::error::{DeviceError, FailureReason};

#[derive(Debug)]
enum Command {
    Scan,
    Disconnect,
    ClearError,
}

enum TransportMessage {
    Permission(PermissionStatus),
    Discovered(DiscoveredPeripheral),
    DiscoveryFailed(DeviceError),
    ConnectOutcome(Result<(Session, LinkStream), DeviceError>),
    Frame(Vec<u8>),
    LinkLost,
}

struct Stamped {
    generation: u64,
    message: TransportMessage,
}

struct ActiveSession {
    id: u64,
    session: Session,
}

/// Cheap to clone handle used by the UI and other collaborators.
#[derive(Clone)]
pub struct DeviceHandle {
    commands: Sender<Command>,
    snapshot: watch::Receiver<DeviceSnapshot>,
    decode_failures: Arc<AtomicU64>,
}

impl DeviceHandle {
    async fn send(&self, command: Command) -> Result<(), DeviceError> {
        self.commands
            .clone()
            .send(command)
            .await
            .map_err(|_| DeviceError::Closed)
    }

    pub async fn request_scan(&self) -> Result<(), DeviceError> {
        self.send(Command::Scan).await
    }

    /// Accepted in every state. Disconnecting an idle machine does nothing.
    pub async fn request_disconnect(&self) -> Result<(), DeviceError> {
        self.send(Command::Disconnect).await
    }

    /// Dismiss the surfaced failure reason. Never changes the connection state.
    pub async fn clear_error(&self) -> Result<(), DeviceError> {
        self.send(Command::ClearError).await
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state.clone()
    }

    pub fn discovered(&self) -> Arc<Vec<DiscoveredPeripheral>> {
        self.snapshot.borrow().discovered.clone()
    }

    pub fn watch(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    /// Number of frames dropped because they could not be decoded.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

struct ConnectionMachine {
    transport: Arc<dyn Transport>,
    gate: Arc<dyn PermissionGate>,
    settings: MachineSettings,

    // cancelled when the whole machine stops
    cancel: CancellationToken,
    // cancelled when the current scan/session cycle ends
    cycle: CancellationToken,
    discovery: Option<CancellationToken>,
    generation: u64,
    pending_permission: bool,
    scan_deadline: Option<Instant>,

    session: Option<ActiveSession>,
    next_session_id: u64,

    snapshot: DeviceSnapshot,
    snapshot_tx: watch::Sender<DeviceSnapshot>,
    senders: Vec<Sender<DeviceEvent>>,
    internal_tx: Sender<Stamped>,
    decode_failures: Arc<AtomicU64>,
}

async fn post(tx: &mut Sender<Stamped>, generation: u64, message: TransportMessage) -> bool {
    tx.send(Stamped { generation, message }).await.is_ok()
}

async fn scan_timeout(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn permission_task(gate: Arc<dyn PermissionGate>, mut tx: Sender<Stamped>, generation: u64, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {},
        status = gate.check_and_request() => {
            post(&mut tx, generation, TransportMessage::Permission(status)).await;
        },
    }
}

async fn discovery_task(
    transport: Arc<dyn Transport>,
    filter: DiscoveryFilter,
    mut tx: Sender<Stamped>,
    generation: u64,
    cancel: CancellationToken,
) {
    let started = tokio::select! {
        _ = cancel.cancelled() => return,
        started = transport.start_discovery(&filter) => started,
    };

    let mut discovered = match started {
        Ok(stream) => stream,
        Err(err) => {
            post(&mut tx, generation, TransportMessage::DiscoveryFailed(err)).await;
            return;
        },
    };

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            next = discovered.next() => match next {
                Some(peripheral) => {
                    if !post(&mut tx, generation, TransportMessage::Discovered(peripheral)).await {
                        break 'mainloop;
                    }
                },
                None => {
                    debug!("Discovery stream ended");
                    break 'mainloop;
                },
            },
        }
    }
}

async fn connect_and_subscribe(
    transport: &dyn Transport,
    peripheral_id: &str,
    gatt: &GattTarget,
) -> Result<(Session, LinkStream), DeviceError> {
    let session = transport.connect(peripheral_id).await?;

    match transport.subscribe(&session, gatt).await {
        Ok(link) => Ok((session, link)),
        Err(err) => {
            // do not leave a half open session behind
            if let Err(disconnect_err) = transport.disconnect(&session).await {
                warn!("Failed to disconnect after subscribe failure: {:?}", disconnect_err);
            }
            Err(err)
        },
    }
}

async fn connect_task(
    transport: Arc<dyn Transport>,
    peripheral_id: String,
    gatt: GattTarget,
    teardown_deadline: Duration,
    mut tx: Sender<Stamped>,
    generation: u64,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        biased;
        outcome = connect_and_subscribe(transport.as_ref(), &peripheral_id, &gatt) => outcome,
        _ = cancel.cancelled() => {
            info!("Connecting to {} was aborted", peripheral_id);

            // the link may already be up while bonding or discovering services
            let session = Session::real(peripheral_id.as_str());
            match timeout(teardown_deadline, transport.disconnect(&session)).await {
                Err(_) => warn!("Disconnecting an aborted connect took too long"),
                Ok(Err(err)) => warn!("Failed to disconnect an aborted connect: {:?}", err),
                Ok(Ok(())) => {},
            }
            return;
        },
    };

    post(&mut tx, generation, TransportMessage::ConnectOutcome(outcome)).await;
}

async fn link_task(mut link: LinkStream, mut tx: Sender<Stamped>, generation: u64, cancel: CancellationToken) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = link.next() => match event {
                Some(LinkEvent::Frame(value)) => {
                    if !post(&mut tx, generation, TransportMessage::Frame(value)).await {
                        break 'mainloop;
                    }
                },
                Some(LinkEvent::Disconnected) | None => {
                    post(&mut tx, generation, TransportMessage::LinkLost).await;
                    break 'mainloop;
                },
            },
        }
    }
}

impl ConnectionMachine {
    fn publish(&mut self) {
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }

    async fn emit(&mut self, event: DeviceEvent) {
        let mut closed = false;
        for sender in &mut self.senders {
            if sender.send(event.clone()).await.is_err() {
                closed = true;
            }
        }

        if closed {
            self.senders.retain(|sender| !sender.is_closed());
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        let changed = self.snapshot.state != state;
        if changed {
            info!("Connection state: {} -> {}", self.snapshot.state, state);
            self.snapshot.state = state.clone();
        }

        self.publish();

        if changed {
            self.emit(DeviceEvent::StateChange(state)).await;
        }
    }

    async fn fail(&mut self, reason: FailureReason) {
        warn!("{}", reason);
        self.snapshot.last_error = Some(reason.clone());
        self.set_state(ConnectionState::Failed(reason.clone())).await;
        self.emit(DeviceEvent::Error(reason)).await;
    }

    /// Clears the surfaced reason, returns true if there was one.
    fn take_reason(&mut self) -> bool {
        self.snapshot.last_error.take().is_some()
    }

    /// End the current cycle: its tasks stop and their late messages become stale.
    fn advance_generation(&mut self) {
        self.cycle.cancel();
        self.cycle = self.cancel.child_token();
        self.generation += 1;
    }

    fn record_discovery(&mut self, peripheral: DiscoveredPeripheral) {
        let mut discovered = self.snapshot.discovered.as_ref().clone();
        match discovered.iter_mut().find(|known| known.id == peripheral.id) {
            Some(known) => *known = peripheral,
            None => discovered.push(peripheral),
        }

        self.snapshot.discovered = Arc::new(discovered);
        self.snapshot.discovered_version += 1;
        self.publish();
    }

    fn is_target(&self, peripheral: &DiscoveredPeripheral) -> bool {
        peripheral.name.as_deref() == Some(self.settings.target_name.as_str())
    }

    /// Runs inline, so commands and frames queue behind it for at most `teardown_deadline`.
    async fn stop_discovery(&mut self) {
        self.scan_deadline = None;

        if let Some(discovery) = self.discovery.take() {
            discovery.cancel();

            match timeout(self.settings.teardown_deadline, self.transport.stop_discovery()).await {
                Err(_) => warn!("Stopping the scan took too long"),
                Ok(Err(err)) => warn!("Failed to stop scan: {:?}", err),
                Ok(Ok(())) => {},
            }
        }
    }

    /// Like `stop_discovery`, blocks the owner for at most `teardown_deadline`. Observers only
    /// see `Idle` once the transport was released or the deadline passed.
    async fn release_session(&mut self) {
        self.advance_generation();
        self.snapshot.latest_sample = None;
        self.snapshot.is_simulated = false;

        if let Some(active) = self.session.take() {
            info!("Releasing session {} with {}", active.id, active.session.peripheral_id);

            match timeout(self.settings.teardown_deadline, self.transport.disconnect(&active.session)).await {
                Err(_) => warn!("Disconnecting took too long"),
                Ok(Err(err)) => warn!("Failed to disconnect: {:?}", err),
                Ok(Ok(())) => {},
            }
        }
    }

    fn release_orphan(&self, session: Session) {
        let transport = self.transport.clone();
        let deadline = self.settings.teardown_deadline;

        spawn(async move {
            info!("Releasing session with {} that is no longer wanted", session.peripheral_id);
            if let Ok(Err(err)) = timeout(deadline, transport.disconnect(&session)).await {
                warn!("Failed to disconnect: {:?}", err);
            }
        });
    }

    fn on_scan_requested(&mut self) {
        match self.snapshot.state {
            ConnectionState::Idle | ConnectionState::Failed(_) => {},
            ref state => {
                debug!("Ignoring scan request while {}", state);
                return;
            },
        }

        if self.pending_permission {
            debug!("Ignoring scan request, waiting for permission");
            return;
        }

        self.advance_generation();
        self.pending_permission = true;

        spawn(permission_task(
            self.gate.clone(),
            self.internal_tx.clone(),
            self.generation,
            self.cycle.clone(),
        ));
    }

    async fn start_scanning(&mut self) {
        let had_reason = self.take_reason();
        self.snapshot.discovered = Arc::new(Vec::new());
        self.snapshot.discovered_version += 1;
        self.snapshot.latest_sample = None;
        self.snapshot.is_simulated = false;

        let discovery = self.cycle.child_token();
        self.discovery = Some(discovery.clone());
        self.scan_deadline = Some(Instant::now() + self.settings.scan_timeout);

        spawn(discovery_task(
            self.transport.clone(),
            DiscoveryFilter { services: vec![self.settings.gatt.service] },
            self.internal_tx.clone(),
            self.generation,
            discovery,
        ));

        self.set_state(ConnectionState::Scanning).await;
        if had_reason {
            self.emit(DeviceEvent::ErrorCleared).await;
        }
    }

    async fn on_target_found(&mut self, peripheral_id: String) {
        info!("Found target peripheral {}", peripheral_id);
        self.stop_discovery().await;
        self.set_state(ConnectionState::Connecting { target_id: peripheral_id.clone() }).await;

        spawn(connect_task(
            self.transport.clone(),
            peripheral_id,
            self.settings.gatt,
            self.settings.teardown_deadline,
            self.internal_tx.clone(),
            self.generation,
            self.cycle.clone(),
        ));
    }

    async fn on_connected(&mut self, session: Session, link: LinkStream) {
        self.next_session_id += 1;
        let session_id = self.next_session_id;
        let is_simulated = session.is_simulated;

        spawn(link_task(link, self.internal_tx.clone(), self.generation, self.cycle.clone()));

        self.session = Some(ActiveSession { id: session_id, session });
        self.snapshot.is_simulated = is_simulated;
        self.set_state(ConnectionState::Connected { session_id, is_simulated }).await;
    }

    async fn on_frame(&mut self, value: Vec<u8>) {
        match decode_frame(&value, SystemTime::now()) {
            Ok(sample) => {
                self.snapshot.latest_sample = Some(sample);
                self.publish();
                self.emit(DeviceEvent::Sample(sample)).await;
            },
            Err(err) => {
                let dropped = self.decode_failures.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "Dropped frame {:?}: {} ({} dropped so far)",
                    String::from_utf8_lossy(&value),
                    err,
                    dropped,
                );
            },
        }
    }

    async fn on_link_lost(&mut self) {
        warn!("Connection lost");
        self.release_session().await;
        self.snapshot.last_error = Some(FailureReason::UnexpectedDisconnect);
        self.set_state(ConnectionState::Idle).await;
        self.emit(DeviceEvent::Error(FailureReason::UnexpectedDisconnect)).await;
    }

    async fn on_scan_timeout(&mut self) {
        if self.snapshot.state != ConnectionState::Scanning {
            self.scan_deadline = None;
            return;
        }

        info!("No matching peripheral found within {:?}", self.settings.scan_timeout);
        self.stop_discovery().await;
        self.advance_generation();
        self.fail(FailureReason::NotFound).await;
    }

    async fn on_disconnect_requested(&mut self) {
        match self.snapshot.state.clone() {
            ConnectionState::Idle | ConnectionState::Failed(_) => {
                if self.pending_permission {
                    info!("Scan request cancelled");
                    self.pending_permission = false;
                    self.advance_generation();
                } else {
                    debug!("Nothing to disconnect");
                }
                return;
            },
            ConnectionState::Disconnecting => {
                return;
            },
            ConnectionState::Scanning => {
                self.stop_discovery().await;
                self.advance_generation();
            },
            ConnectionState::Connecting { target_id } => {
                info!("Aborting connect to {}", target_id);
                self.advance_generation();
            },
            ConnectionState::Connected { .. } => {
                self.set_state(ConnectionState::Disconnecting).await;
                self.release_session().await;
            },
        }

        let had_reason = self.take_reason();
        self.set_state(ConnectionState::Idle).await;
        if had_reason {
            self.emit(DeviceEvent::ErrorCleared).await;
        }
    }

    async fn on_clear_error(&mut self) {
        if self.take_reason() {
            self.publish();
            self.emit(DeviceEvent::ErrorCleared).await;
        }
    }

    async fn on_command(&mut self, command: Command) {
        debug!("Command {:?}", command);

        match command {
            Command::Scan => self.on_scan_requested(),
            Command::Disconnect => self.on_disconnect_requested().await,
            Command::ClearError => self.on_clear_error().await,
        }
    }

    async fn on_transport(&mut self, stamped: Stamped) {
        if stamped.generation != self.generation {
            debug!("Discarding event from stale generation {} (current {})", stamped.generation, self.generation);
            if let TransportMessage::ConnectOutcome(Ok((session, _))) = stamped.message {
                self.release_orphan(session);
            }
            return;
        }

        let state = self.snapshot.state.clone();
        match (stamped.message, state) {
            (TransportMessage::Permission(status), ConnectionState::Idle | ConnectionState::Failed(_)) if self.pending_permission => {
                self.pending_permission = false;
                match status {
                    PermissionStatus::Granted => self.start_scanning().await,
                    PermissionStatus::Denied => self.fail(FailureReason::PermissionDenied).await,
                }
            },
            (TransportMessage::Discovered(peripheral), ConnectionState::Scanning) => {
                let is_target = self.is_target(&peripheral);
                let peripheral_id = peripheral.id.clone();

                debug!("Discovered {} ({})", peripheral.display_name(), peripheral.id);
                self.record_discovery(peripheral);

                if is_target {
                    self.on_target_found(peripheral_id).await;
                }
            },
            (TransportMessage::DiscoveryFailed(err), ConnectionState::Scanning) => {
                warn!("Scanning failed {:?}", err);
                self.stop_discovery().await;
                self.advance_generation();
                self.fail(FailureReason::from_scan_error(&err)).await;
            },
            (TransportMessage::ConnectOutcome(outcome), ConnectionState::Connecting { .. }) => match outcome {
                Ok((session, link)) => self.on_connected(session, link).await,
                Err(err) => {
                    warn!("Connecting to peripheral failed: {:?}", err);
                    self.advance_generation();
                    self.fail(FailureReason::ConnectError(err.to_string())).await;
                },
            },
            (TransportMessage::ConnectOutcome(Ok((session, _))), _) => {
                self.release_orphan(session);
            },
            (TransportMessage::Frame(value), ConnectionState::Connected { .. }) => {
                self.on_frame(value).await;
            },
            (TransportMessage::LinkLost, ConnectionState::Connected { .. }) => {
                self.on_link_lost().await;
            },
            (_, state) => {
                debug!("Ignoring transport event while {}", state);
            },
        }
    }

    async fn shutdown(&mut self) {
        self.pending_permission = false;

        match self.snapshot.state {
            ConnectionState::Scanning => self.stop_discovery().await,
            ConnectionState::Connected { .. } => self.release_session().await,
            _ => {},
        }

        self.cycle.cancel();
        self.set_state(ConnectionState::Idle).await;
        info!("Connection state machine stopped");
    }

    async fn run(mut self, mut commands: Receiver<Command>, mut internal: Receiver<Stamped>) {
        let cancel = self.cancel.clone();

        'mainloop: loop {
            let deadline = self.scan_deadline;

            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(command) = commands.next() => {
                    self.on_command(command).await;
                },
                Some(stamped) = internal.next() => {
                    self.on_transport(stamped).await;
                },
                _ = scan_timeout(deadline) => {
                    self.on_scan_timeout().await;
                },
            }
        }

        self.shutdown().await;
    }
}

impl ConnectionMachine {
    fn new(
        cancel: CancellationToken,
        backend: Backend,
        settings: MachineSettings,
        senders: Vec<Sender<DeviceEvent>>,
    ) -> (Self, DeviceHandle, Receiver<Command>, Receiver<Stamped>) {
        let (command_tx, command_rx) = channel::<Command>(8);
        let (internal_tx, internal_rx) = channel::<Stamped>(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(DeviceSnapshot::default());
        let decode_failures = Arc::new(AtomicU64::new(0));

        let machine = ConnectionMachine {
            transport: backend.transport,
            gate: backend.gate,
            settings,
            cycle: cancel.child_token(),
            cancel,
            discovery: None,
            generation: 0,
            pending_permission: false,
            scan_deadline: None,
            session: None,
            next_session_id: 0,
            snapshot: DeviceSnapshot::default(),
            snapshot_tx,
            senders,
            internal_tx,
            decode_failures: decode_failures.clone(),
        };

        let handle = DeviceHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            decode_failures,
        };

        (machine, handle, command_rx, internal_rx)
    }
}

/// Start the connection state machine. It runs until `cancel` is cancelled.
///
/// Every state change, accepted sample and surfaced error is pushed to each of `senders`, in the
/// order it was applied.
pub fn spawn_connection_machine(
    cancel: CancellationToken,
    backend: Backend,
    settings: MachineSettings,
    senders: Vec<Sender<DeviceEvent>>,
) -> (DeviceHandle, JoinHandle<()>) {
    let (machine, handle, commands, internal) = ConnectionMachine::new(cancel, backend, settings, senders);

    (handle, spawn(machine.run(commands, internal)))
}
