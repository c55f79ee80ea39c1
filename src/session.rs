use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::ble::{BleTransport, DeviceId, TransportEvent, WriteMode};
use crate::catalog::{ProfileCandidate, default_catalog, matching_candidates, normalize_uuid};
use crate::command::{
    ChunkAccumulator, CommandResponse, ResponseShape, encode_command, shape_response,
};
use crate::config::SessionConfig;
use crate::error::{ErrorKind, SessionError};
use crate::state::{Action, ActiveConfig, ConnectionPhase, SessionSnapshot, SessionState};
use crate::utils::format_hex;

const REQUEST_CHANNEL_CAPACITY: usize = 16;
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// What the handshake resolved for a connected adapter.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ConnectedProfile {
    device: DeviceId,
    profile: String,
    write_mode: WriteMode,
}

impl ConnectedProfile {
    /// Returns the connected peripheral identifier.
    #[must_use]
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Returns the label of the matched catalog profile.
    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Returns the write mode resolved for command writes.
    #[must_use]
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }
}

/// A live subscription to session state snapshots.
///
/// Dropping the subscription releases its resources.
#[derive(Debug)]
pub struct StateSubscription {
    initial: SessionSnapshot,
    updates: broadcast::Receiver<SessionSnapshot>,
}

impl StateSubscription {
    /// Returns the snapshot taken at subscription time.
    #[must_use]
    pub fn initial(&self) -> &SessionSnapshot {
        &self.initial
    }

    /// Waits for the next state transition. Returns `None` once the session
    /// task has stopped.
    pub async fn next(&mut self) -> Option<SessionSnapshot> {
        loop {
            match self.updates.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session snapshot stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Request {
    Initialize {
        reply: Reply<()>,
    },
    QueryAdapterState {
        reply: Reply<bool>,
    },
    Connect {
        device: DeviceId,
        reply: Reply<ConnectedProfile>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Send {
        command: String,
        shape: ResponseShape,
        timeout: Option<Duration>,
        reply: Reply<CommandResponse>,
    },
    SetStreaming {
        enabled: bool,
        reply: Reply<()>,
    },
    Subscribe {
        reply: oneshot::Sender<StateSubscription>,
    },
}

/// Handle to an adapter session.
///
/// The session's state lives on a dedicated task; handles serialize requests
/// into it, so state mutation is single-threaded and transport events are
/// processed in arrival order. Cloning returns another handle to the same
/// session. The task stops when [`shutdown`] is called or every handle has
/// been dropped.
///
/// [`shutdown`]: AdapterSession::shutdown
#[derive(Debug, Clone)]
pub struct AdapterSession {
    requests: mpsc::Sender<Request>,
    cancel: CancellationToken,
}

impl AdapterSession {
    /// Creates a session over a transport and spawns its task.
    ///
    /// The transport event stream is subscribed before the task starts, so
    /// no event observable after [`initialize`] can be missed.
    ///
    /// [`initialize`]: AdapterSession::initialize
    #[must_use]
    pub fn new(transport: Arc<dyn BleTransport>, mut config: SessionConfig) -> Self {
        let (requests, request_receiver) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let events = transport.subscribe_events();
        let catalog = config.take_catalog().unwrap_or_else(default_catalog);

        let task = SessionTask {
            transport,
            config,
            catalog,
            state: SessionState::new(),
            epoch: Instant::now(),
            requests: request_receiver,
            events: Some(events),
            snapshots,
            in_flight: None,
            ticker: None,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Self { requests, cancel }
    }

    /// Initialises the transport and records the adapter power state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TransportInit`] when the transport fails to
    /// start.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        self.request(|reply| Request::Initialize { reply }).await
    }

    /// Queries the adapter radio power state.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport query fails.
    pub async fn query_adapter_state(&self) -> Result<bool, SessionError> {
        self.request(|reply| Request::QueryAdapterState { reply })
            .await
    }

    /// Connects to a peripheral and performs the profile handshake.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::AlreadyConnected`], [`SessionError::InProgress`],
    /// or [`SessionError::BluetoothOff`] when preconditions do not hold, with
    /// [`SessionError::Incompatible`] when no catalog profile matches, and
    /// with a transport error otherwise.
    pub async fn connect(
        &self,
        device: impl Into<DeviceId>,
    ) -> Result<ConnectedProfile, SessionError> {
        let device = device.into();
        self.request(|reply| Request::Connect { device, reply })
            .await
    }

    /// Disconnects from the peripheral. A no-op when already disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport teardown fails; local state is
    /// reset to disconnected regardless.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Request::Disconnect { reply }).await
    }

    /// Sends one command using the configured default timeout.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::NotConnected`], [`SessionError::CommandPending`],
    /// [`SessionError::Write`], or [`SessionError::Disconnected`].
    pub async fn send(
        &self,
        command: impl Into<String>,
        shape: ResponseShape,
    ) -> Result<CommandResponse, SessionError> {
        self.send_with_timeout(command, shape, None).await
    }

    /// Sends one command with an explicit per-call timeout.
    ///
    /// A command that reaches its deadline resolves successfully with
    /// whatever chunks arrived, possibly none; callers classify empty
    /// payloads themselves.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::NotConnected`], [`SessionError::CommandPending`],
    /// [`SessionError::Write`], or [`SessionError::Disconnected`].
    pub async fn send_with_timeout(
        &self,
        command: impl Into<String>,
        shape: ResponseShape,
        timeout: Option<Duration>,
    ) -> Result<CommandResponse, SessionError> {
        let command = command.into();
        self.request(|reply| Request::Send {
            command,
            shape,
            timeout,
            reply,
        })
        .await
    }

    /// Sets the streaming intent flag, arming or disarming the inactivity
    /// watchdog. Setting the current value again is a no-op.
    ///
    /// # Errors
    ///
    /// Enabling fails with [`SessionError::NotConnected`] while no adapter is
    /// connected.
    pub async fn set_streaming(&self, enabled: bool) -> Result<(), SessionError> {
        self.request(|reply| Request::SetStreaming { enabled, reply })
            .await
    }

    /// Subscribes to state snapshots. The subscription carries the snapshot
    /// taken at subscription time plus every later transition.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] when the session task has stopped.
    pub async fn subscribe(&self) -> Result<StateSubscription, SessionError> {
        let (reply, receive) = oneshot::channel();
        self.requests
            .send(Request::Subscribe { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        receive.await.map_err(|_| SessionError::Closed)
    }

    /// Stops the session task. Pending calls resolve with
    /// [`SessionError::Closed`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, SessionError> {
        let (reply, receive) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        receive.await.map_err(|_| SessionError::Closed)?
    }
}

/// The record held while a command is in flight. Destroyed exactly once: by
/// terminator detection, deadline expiry, disconnect, or session teardown.
struct CommandSlot {
    command: String,
    shape: ResponseShape,
    accumulator: ChunkAccumulator,
    reply: Reply<CommandResponse>,
    deadline: Instant,
}

struct SessionTask {
    transport: Arc<dyn BleTransport>,
    config: SessionConfig,
    catalog: Vec<ProfileCandidate>,
    state: SessionState,
    epoch: Instant,
    requests: mpsc::Receiver<Request>,
    events: Option<broadcast::Receiver<TransportEvent>>,
    snapshots: broadcast::Sender<SessionSnapshot>,
    in_flight: Option<CommandSlot>,
    ticker: Option<Interval>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                maybe_request = self.requests.recv() => match maybe_request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                maybe_event = next_event(&mut self.events) => match maybe_event {
                    Some(event) => self.handle_event(event),
                    None => self.events = None,
                },
                () = command_deadline(&self.in_flight) => self.finish_on_deadline(),
                () = next_tick(&mut self.ticker) => self.watchdog_check(),
            }
        }
        debug!("session task stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Initialize { reply } => {
                let result = self.initialize().await;
                let _ = reply.send(result);
            }
            Request::QueryAdapterState { reply } => {
                let result = self.query_adapter_state().await;
                let _ = reply.send(result);
            }
            Request::Connect { device, reply } => {
                let result = self.connect(device).await;
                let _ = reply.send(result);
            }
            Request::Disconnect { reply } => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
            Request::Send {
                command,
                shape,
                timeout,
                reply,
            } => self.send(command, shape, timeout, reply).await,
            Request::SetStreaming { enabled, reply } => {
                let result = self.set_streaming(enabled);
                let _ = reply.send(result);
            }
            Request::Subscribe { reply } => {
                let subscription = StateSubscription {
                    initial: self.state.snapshot(self.epoch),
                    updates: self.snapshots.subscribe(),
                };
                let _ = reply.send(subscription);
            }
        }
    }

    fn apply(&mut self, action: Action) {
        trace!(?action, "applying state transition");
        self.state.apply(action);
        let _ = self.snapshots.send(self.state.snapshot(self.epoch));
    }

    async fn initialize(&mut self) -> Result<(), SessionError> {
        self.transport
            .start()
            .await
            .map_err(SessionError::TransportInit)?;
        let power = self
            .transport
            .adapter_state()
            .await
            .map_err(SessionError::TransportInit)?;
        self.apply(Action::AdapterPowerChanged {
            powered_on: power.is_on(),
        });
        Ok(())
    }

    async fn query_adapter_state(&mut self) -> Result<bool, SessionError> {
        let power = self.transport.adapter_state().await?;
        self.apply(Action::AdapterPowerChanged {
            powered_on: power.is_on(),
        });
        Ok(power.is_on())
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn connect(&mut self, device: DeviceId) -> Result<ConnectedProfile, SessionError> {
        match self.state.connection {
            ConnectionPhase::Connected { .. } => return Err(SessionError::AlreadyConnected),
            ConnectionPhase::Connecting | ConnectionPhase::Disconnecting => {
                return Err(SessionError::InProgress);
            }
            ConnectionPhase::Disconnected => {}
        }
        if !self.state.bluetooth_on {
            return Err(SessionError::BluetoothOff);
        }

        self.apply(Action::ConnectStart);
        match self.handshake(&device).await {
            Ok(profile) => Ok(profile),
            Err(error) => {
                if let Err(fault) = self.transport.disconnect(&device).await {
                    debug!(?fault, "best-effort disconnect after failed handshake");
                }
                self.apply(Action::ConnectFailed { kind: error.kind() });
                Err(error)
            }
        }
    }

    async fn handshake(&mut self, device: &DeviceId) -> Result<ConnectedProfile, SessionError> {
        self.transport.connect(device).await?;
        let inventory = self.transport.retrieve_services(device).await?;

        for matched in matching_candidates(&self.catalog, &inventory) {
            let candidate = matched.candidate();
            match self
                .transport
                .start_notifications(
                    device,
                    candidate.service_uuid(),
                    candidate.notify_characteristic_uuid(),
                )
                .await
            {
                Ok(()) => {
                    info!(
                        profile = candidate.label(),
                        write_mode = %matched.write_mode(),
                        "profile handshake succeeded"
                    );
                    let profile = ConnectedProfile {
                        device: device.clone(),
                        profile: candidate.label().to_string(),
                        write_mode: matched.write_mode(),
                    };
                    self.apply(Action::ConnectSucceeded {
                        device: device.clone(),
                        config: ActiveConfig {
                            profile: candidate.clone(),
                            write_mode: matched.write_mode(),
                        },
                    });
                    return Ok(profile);
                }
                Err(fault) => {
                    debug!(
                        profile = candidate.label(),
                        ?fault,
                        "starting notifications failed; trying next catalog candidate"
                    );
                }
            }
        }

        Err(SessionError::Incompatible)
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&mut self) -> Result<(), SessionError> {
        let (device, config) = match &self.state.connection {
            ConnectionPhase::Connected { device, config } => (device.clone(), config.clone()),
            _ => return Ok(()),
        };

        self.apply(Action::DisconnectStart);
        self.reject_in_flight(SessionError::Disconnected);
        self.ticker = None;

        if let Err(fault) = self
            .transport
            .stop_notifications(
                &device,
                config.profile.service_uuid(),
                config.profile.notify_characteristic_uuid(),
            )
            .await
        {
            debug!(?fault, "failed to stop notifications cleanly");
        }

        let result = self.transport.disconnect(&device).await;
        self.apply(Action::DisconnectFinished);
        result.map_err(SessionError::from)
    }

    async fn send(
        &mut self,
        command: String,
        shape: ResponseShape,
        timeout: Option<Duration>,
        reply: Reply<CommandResponse>,
    ) {
        let (device, config) = match &self.state.connection {
            ConnectionPhase::Connected { device, config } => (device.clone(), config.clone()),
            _ => {
                let _ = reply.send(Err(SessionError::NotConnected));
                return;
            }
        };
        if self.in_flight.is_some() {
            let _ = reply.send(Err(SessionError::CommandPending));
            return;
        }

        let deadline =
            Instant::now() + timeout.unwrap_or_else(|| self.config.default_command_timeout());
        self.in_flight = Some(CommandSlot {
            command: command.clone(),
            shape,
            accumulator: ChunkAccumulator::default(),
            reply,
            deadline,
        });
        self.apply(Action::SendStart);

        let payload = encode_command(&command);
        trace!(
            command = command.as_str(),
            payload_len = payload.len(),
            "writing command"
        );
        let write_result = match config.write_mode {
            WriteMode::WithResponse => {
                self.transport
                    .write(
                        &device,
                        config.profile.service_uuid(),
                        config.profile.write_characteristic_uuid(),
                        &payload,
                    )
                    .await
            }
            WriteMode::WithoutResponse => {
                self.transport
                    .write_without_response(
                        &device,
                        config.profile.service_uuid(),
                        config.profile.write_characteristic_uuid(),
                        &payload,
                    )
                    .await
            }
        };

        if let Err(fault) = write_result {
            let slot = self.in_flight.take();
            self.apply(Action::SendFailed {
                kind: ErrorKind::WriteError,
            });
            if let Some(slot) = slot {
                let _ = slot.reply.send(Err(SessionError::Write(fault)));
            }
        }
    }

    fn set_streaming(&mut self, enabled: bool) -> Result<(), SessionError> {
        if enabled {
            if !self.state.is_connected() {
                return Err(SessionError::NotConnected);
            }
            if self.state.streaming {
                return Ok(());
            }
            let now = Instant::now();
            self.ticker = Some(interval_at(
                now + self.config.watchdog_tick(),
                self.config.watchdog_tick(),
            ));
            self.apply(Action::StreamingStarted { at: now });
        } else {
            if !self.state.streaming {
                return Ok(());
            }
            self.ticker = None;
            self.apply(Action::StreamingStopped);
        }
        Ok(())
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::AdapterState(power) => {
                let powered_on = power.is_on();
                if !powered_on {
                    self.reject_in_flight(SessionError::Disconnected);
                    self.ticker = None;
                }
                self.apply(Action::AdapterPowerChanged { powered_on });
            }
            TransportEvent::Disconnected { device } => {
                if self.state.connected_device() != Some(&device) {
                    trace!(%device, "ignoring disconnect for unrelated peripheral");
                    return;
                }
                info!(%device, "peripheral disconnected unexpectedly");
                self.reject_in_flight(SessionError::Disconnected);
                self.ticker = None;
                self.apply(Action::LinkLost);
            }
            TransportEvent::Notification {
                device,
                characteristic,
                payload,
                ..
            } => {
                if !self.should_route(&device, &characteristic) {
                    trace!(
                        %device,
                        characteristic = characteristic.as_str(),
                        payload = %format_hex(&payload),
                        "discarding notification with no routable command"
                    );
                    return;
                }
                let Some(slot) = self.in_flight.as_mut() else {
                    return;
                };
                trace!(payload = %format_hex(&payload), "absorbing response chunk");
                let complete = slot.accumulator.absorb(&payload);
                if complete && let Some(slot) = self.in_flight.take() {
                    self.resolve_slot(slot);
                }
            }
        }
    }

    fn should_route(&self, device: &DeviceId, characteristic: &str) -> bool {
        if self.in_flight.is_none() {
            return false;
        }
        if self.state.connected_device() != Some(device) {
            return false;
        }
        let Some(config) = self.state.active_config() else {
            return false;
        };
        normalize_uuid(characteristic) == config.profile.notify_characteristic_uuid()
    }

    fn finish_on_deadline(&mut self) {
        if let Some(slot) = self.in_flight.take() {
            debug!(
                command = slot.command.as_str(),
                "command deadline reached; resolving with partial data"
            );
            self.resolve_slot(slot);
        }
    }

    fn resolve_slot(&mut self, slot: CommandSlot) {
        let CommandSlot {
            shape,
            accumulator,
            reply,
            ..
        } = slot;
        let response = shape_response(shape, accumulator.into_chunks());
        self.apply(Action::SendSucceeded { at: Instant::now() });
        let _ = reply.send(Ok(response));
    }

    fn reject_in_flight(&mut self, error: SessionError) {
        if let Some(slot) = self.in_flight.take() {
            debug!(command = slot.command.as_str(), "rejecting in-flight command");
            let _ = slot.reply.send(Err(error));
        }
    }

    fn watchdog_check(&mut self) {
        if !self.state.streaming {
            self.ticker = None;
            return;
        }
        let reference = match (self.state.last_success_at, self.state.streaming_since) {
            (Some(success), Some(since)) => success.max(since),
            (None, Some(since)) => since,
            _ => return,
        };
        if reference.elapsed() >= self.config.streaming_inactivity() {
            info!("streaming stopped by inactivity watchdog");
            self.ticker = None;
            self.apply(Action::StreamingTimedOut);
        }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        None => {
            std::future::pending::<()>().await;
            None
        }
        Some(receiver) => loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transport event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
    }
}

async fn command_deadline(slot: &Option<CommandSlot>) {
    match slot {
        Some(slot) => sleep_until(slot.deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
