use derive_more::Display;
use serde_with::SerializeDisplay;
use thiserror::Error;

/// Errors returned by adapter session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("the Bluetooth adapter is powered off")]
    BluetoothOff,
    #[error("no adapter is connected")]
    NotConnected,
    #[error("an adapter is already connected")]
    AlreadyConnected,
    #[error("a connection attempt or teardown is already in progress")]
    InProgress,
    #[error("no catalog profile matched the services advertised by the adapter")]
    Incompatible,
    #[error("writing the command to the adapter failed")]
    Write(#[source] TransportFault),
    #[error("the adapter disconnected")]
    Disconnected,
    #[error("another command is already in flight")]
    CommandPending,
    #[error("streaming stopped after the inactivity window elapsed without a completed command")]
    StreamingInactive,
    #[error("transport initialisation failed")]
    TransportInit(#[source] TransportFault),
    #[error(transparent)]
    Transport(#[from] TransportFault),
    #[error("the session task has stopped")]
    Closed,
}

impl SessionError {
    /// Returns the kind recorded in session snapshots for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BluetoothOff => ErrorKind::BluetoothOff,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::AlreadyConnected => ErrorKind::AlreadyConnected,
            Self::InProgress => ErrorKind::InProgress,
            Self::Incompatible => ErrorKind::Incompatible,
            Self::Write(_) => ErrorKind::WriteError,
            Self::Disconnected => ErrorKind::Disconnected,
            Self::CommandPending => ErrorKind::CommandPending,
            Self::StreamingInactive => ErrorKind::StreamingInactive,
            Self::TransportInit(_) => ErrorKind::TransportInit,
            Self::Transport(_) => ErrorKind::TransportError,
            Self::Closed => ErrorKind::Closed,
        }
    }
}

/// Error kinds as recorded in [`SessionSnapshot`](crate::SessionSnapshot)s.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, SerializeDisplay)]
pub enum ErrorKind {
    #[display("bluetooth_off")]
    BluetoothOff,
    #[display("not_connected")]
    NotConnected,
    #[display("already_connected")]
    AlreadyConnected,
    #[display("in_progress")]
    InProgress,
    #[display("incompatible")]
    Incompatible,
    #[display("write_error")]
    WriteError,
    #[display("disconnected")]
    Disconnected,
    #[display("command_pending")]
    CommandPending,
    #[display("streaming_inactive")]
    StreamingInactive,
    #[display("transport_init")]
    TransportInit,
    #[display("transport_error")]
    TransportError,
    #[display("closed")]
    Closed,
}

/// Faults raised by transport backends.
#[derive(Debug, Error)]
pub enum TransportFault {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("peripheral `{device_id}` was not seen by the transport")]
    UnknownDevice { device_id: String },
    #[error("no peripheral advertising a name starting with `{prefix}*` was found")]
    NoMatchingDevice { prefix: String },
    #[error("the transport fixture rejected the operation: {reason}")]
    Scripted { reason: String },
}

/// Errors returned when parsing fake transport fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the service fixture is empty")]
    EmptyFixture,
    #[error("service fixture records must look like `service:char=prop+prop,...`")]
    InvalidServiceRecord,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("reply fixture steps must be hex payloads, `silence`, or `drop`")]
    InvalidReplyStep,
    #[error("failed to decode hex payload")]
    InvalidHexPayload(#[from] hex::FromHexError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("either --device or --name-prefix must be provided")]
    MissingDeviceSelector,
    #[error("--name-prefix is not supported by the fake backend; pass --device")]
    NamePrefixWithFakeBackend,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
