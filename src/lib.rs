mod app;
mod ble;
mod catalog;
mod cli;
mod command;
mod config;
mod error;
mod session;
mod state;
mod telemetry;
mod utils;

pub use app::run;
pub use ble::{
    AdapterPower, BleTransport, BtleplugBackend, CannedInventory, CharacteristicInfo, DeviceId,
    FakeBackend, FakeBackendConfig, ReplyFixture, ReplyScript, ReplyStep, ServiceFixture,
    ServiceInfo, ServiceInventory, TransportEvent, WriteMode, WriteRecord,
};
pub use catalog::{ProfileCandidate, default_catalog};
pub use cli::{Args, Command, LogLevel, OutputFormat, SendArgs, StreamArgs};
pub use command::{CommandResponse, ResponseShape};
pub use config::SessionConfig;
pub use error::{ErrorKind, FixtureError, SessionError, TransportFault};
pub use session::{AdapterSession, ConnectedProfile, StateSubscription};
pub use state::{ConnectionSummary, SessionSnapshot};
