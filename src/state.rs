use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::ble::{DeviceId, WriteMode};
use crate::catalog::ProfileCandidate;
use crate::error::ErrorKind;

/// The profile triple and write mode fixed by a successful handshake.
/// Exists only while connected.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct ActiveConfig {
    pub(crate) profile: ProfileCandidate,
    pub(crate) write_mode: WriteMode,
}

/// Connection lifecycle phase.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected {
        device: DeviceId,
        config: ActiveConfig,
    },
    Disconnecting,
}

/// The session's mutable state. All mutations flow through [`apply`].
///
/// The store tracks whether a command is in flight as a flag only; the
/// command's resolver and timer are owned by the session task.
///
/// [`apply`]: SessionState::apply
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) bluetooth_on: bool,
    pub(crate) connection: ConnectionPhase,
    pub(crate) in_flight: bool,
    pub(crate) streaming: bool,
    pub(crate) last_success_at: Option<Instant>,
    pub(crate) streaming_since: Option<Instant>,
    pub(crate) last_error: Option<ErrorKind>,
}

/// State transitions. The reducer is pure with respect to state; side
/// effects are orchestrated by the session task around it.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    AdapterPowerChanged { powered_on: bool },
    ConnectStart,
    ConnectSucceeded { device: DeviceId, config: ActiveConfig },
    ConnectFailed { kind: ErrorKind },
    DisconnectStart,
    DisconnectFinished,
    LinkLost,
    SendStart,
    SendSucceeded { at: Instant },
    SendFailed { kind: ErrorKind },
    StreamingStarted { at: Instant },
    StreamingStopped,
    StreamingTimedOut,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            bluetooth_on: false,
            connection: ConnectionPhase::Disconnected,
            in_flight: false,
            streaming: false,
            last_success_at: None,
            streaming_since: None,
            last_error: None,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.connection, ConnectionPhase::Connected { .. })
    }

    pub(crate) fn connected_device(&self) -> Option<&DeviceId> {
        match &self.connection {
            ConnectionPhase::Connected { device, .. } => Some(device),
            _ => None,
        }
    }

    pub(crate) fn active_config(&self) -> Option<&ActiveConfig> {
        match &self.connection {
            ConnectionPhase::Connected { config, .. } => Some(config),
            _ => None,
        }
    }

    /// Applies one transition. Actions that record an error clear the
    /// transient flags in the same step.
    pub(crate) fn apply(&mut self, action: Action) {
        match action {
            Action::AdapterPowerChanged { powered_on } => {
                self.bluetooth_on = powered_on;
                if !powered_on {
                    self.connection = ConnectionPhase::Disconnected;
                    self.in_flight = false;
                    self.streaming = false;
                    self.streaming_since = None;
                }
            }
            Action::ConnectStart => {
                self.connection = ConnectionPhase::Connecting;
                self.last_error = None;
            }
            Action::ConnectSucceeded { device, config } => {
                self.connection = ConnectionPhase::Connected { device, config };
            }
            Action::ConnectFailed { kind } => {
                self.connection = ConnectionPhase::Disconnected;
                self.in_flight = false;
                self.last_error = Some(kind);
            }
            Action::DisconnectStart => {
                self.connection = ConnectionPhase::Disconnecting;
            }
            Action::DisconnectFinished => {
                self.connection = ConnectionPhase::Disconnected;
                self.in_flight = false;
                self.streaming = false;
                self.streaming_since = None;
            }
            Action::LinkLost => {
                self.connection = ConnectionPhase::Disconnected;
                self.in_flight = false;
                self.streaming = false;
                self.streaming_since = None;
                self.last_error = Some(ErrorKind::Disconnected);
            }
            Action::SendStart => {
                self.in_flight = true;
                self.last_error = None;
            }
            Action::SendSucceeded { at } => {
                self.in_flight = false;
                self.last_success_at = Some(at);
            }
            Action::SendFailed { kind } => {
                self.in_flight = false;
                self.last_error = Some(kind);
            }
            Action::StreamingStarted { at } => {
                self.streaming = true;
                self.streaming_since = Some(at);
            }
            Action::StreamingStopped => {
                self.streaming = false;
                self.streaming_since = None;
            }
            Action::StreamingTimedOut => {
                self.streaming = false;
                self.streaming_since = None;
                self.last_success_at = None;
                self.last_error = Some(ErrorKind::StreamingInactive);
            }
        }
    }

    /// Builds the observer view of this state. Monotonic timestamps are
    /// exposed as offsets from the session epoch.
    pub(crate) fn snapshot(&self, epoch: Instant) -> SessionSnapshot {
        SessionSnapshot {
            bluetooth_on: self.bluetooth_on,
            connection: ConnectionSummary::from_phase(&self.connection),
            command_in_flight: self.in_flight,
            streaming: self.streaming,
            last_success_offset: self
                .last_success_at
                .map(|at| at.saturating_duration_since(epoch)),
            last_error: self.last_error,
        }
    }
}

/// Observer view of the connection phase.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum ConnectionSummary {
    Disconnected,
    Connecting,
    Connected {
        device: DeviceId,
        profile: String,
        write_mode: WriteMode,
    },
    Disconnecting,
}

impl ConnectionSummary {
    fn from_phase(phase: &ConnectionPhase) -> Self {
        match phase {
            ConnectionPhase::Disconnected => Self::Disconnected,
            ConnectionPhase::Connecting => Self::Connecting,
            ConnectionPhase::Connected { device, config } => Self::Connected {
                device: device.clone(),
                profile: config.profile.label().to_string(),
                write_mode: config.write_mode,
            },
            ConnectionPhase::Disconnecting => Self::Disconnecting,
        }
    }

    /// Returns whether this summary describes a connected session.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Immutable snapshot delivered to subscribers after every state transition.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SessionSnapshot {
    bluetooth_on: bool,
    connection: ConnectionSummary,
    command_in_flight: bool,
    streaming: bool,
    last_success_offset: Option<Duration>,
    last_error: Option<ErrorKind>,
}

impl SessionSnapshot {
    /// Returns the last observed adapter power state.
    #[must_use]
    pub fn bluetooth_on(&self) -> bool {
        self.bluetooth_on
    }

    /// Returns the connection phase summary.
    #[must_use]
    pub fn connection(&self) -> &ConnectionSummary {
        &self.connection
    }

    /// Returns whether a command is in flight.
    #[must_use]
    pub fn command_in_flight(&self) -> bool {
        self.command_in_flight
    }

    /// Returns the streaming intent flag.
    #[must_use]
    pub fn streaming(&self) -> bool {
        self.streaming
    }

    /// Returns the monotonic offset of the last successful command
    /// completion, measured from session creation.
    #[must_use]
    pub fn last_success_offset(&self) -> Option<Duration> {
        self.last_success_offset
    }

    /// Returns the most recent error kind, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }
}
