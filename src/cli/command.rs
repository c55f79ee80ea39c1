use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

use crate::ble::{DeviceId, FakeBackendConfig, ReplyFixture, ServiceFixture};
use crate::command::ResponseShape;
use crate::error::CliConfigError;

/// Command-line options for the ELM327 BLE tool.
#[derive(Debug, Parser)]
#[command(name = "elmlink", about = "Talk to ELM327-compatible OBD-II BLE adapters.")]
pub struct Args {
    /// Transport-assigned identifier of the adapter to connect to.
    #[arg(long, global = true)]
    device: Option<String>,
    /// Connect to the first peripheral whose advertised name starts with this
    /// prefix.
    #[arg(long, global = true, conflicts_with = "device")]
    name_prefix: Option<String>,
    /// How long to wait for the peripheral to appear (e.g. `10s`).
    #[arg(long, global = true, value_parser = parse_duration, default_value = "10s")]
    discovery_timeout: Duration,
    /// Uses the fake BLE backend with fixture-driven services and replies.
    #[arg(long, global = true, hide = true)]
    fake: bool,
    /// Fake GATT inventory: a canned name (`spp_ffe1`, `vendor_ffe0`,
    /// `transparent_uart`) or `service:char=prop+prop,...` records.
    #[arg(long, global = true, requires = "fake", hide = true)]
    fake_services: Option<ServiceFixture>,
    /// Identifier the fake peripheral answers to.
    #[arg(long, global = true, requires = "fake", hide = true)]
    fake_device: Option<String>,
    /// Scripted write replies: `;`-separated scripts of `,`-separated hex
    /// payloads, `silence`, or `drop`.
    #[arg(long, global = true, requires = "fake", hide = true)]
    fake_replies: Option<ReplyFixture>,
    /// Override the telemetry log verbosity.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format for command results. Defaults to `pretty`.
    #[arg(long, global = true, value_enum)]
    output_format: Option<OutputFormat>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Returns an optional CLI override for telemetry log level.
    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Returns the explicitly selected output format, if any.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output_format
    }

    /// Resolves parsed CLI arguments into runtime settings.
    pub(crate) fn into_runtime(self) -> Result<RuntimeArgs, CliConfigError> {
        let Args {
            device,
            name_prefix,
            discovery_timeout,
            fake,
            fake_services,
            fake_device,
            fake_replies,
            log_level: _,
            output_format: _,
            command,
        } = self;

        let backend = if fake {
            if name_prefix.is_some() {
                return Err(CliConfigError::NamePrefixWithFakeBackend);
            }
            BackendChoice::Fake(
                FakeBackendConfig::builder()
                    .maybe_inventory(fake_services.map(Into::into))
                    .maybe_device(fake_device.map(DeviceId::from))
                    .maybe_replies(fake_replies.map(Into::into))
                    .build(),
            )
        } else {
            BackendChoice::Real
        };

        let target = match (&backend, device, name_prefix) {
            (_, Some(device), _) => Target::Device(DeviceId::from(device)),
            (BackendChoice::Fake(_), None, _) => Target::FakeDefault,
            (BackendChoice::Real, None, Some(prefix)) => Target::NamePrefix(prefix),
            (BackendChoice::Real, None, None) => {
                return Err(CliConfigError::MissingDeviceSelector);
            }
        };

        Ok(RuntimeArgs {
            backend,
            target,
            discovery_timeout,
            command,
        })
    }
}

/// Backend selected by CLI flags.
#[derive(Debug)]
pub(crate) enum BackendChoice {
    Real,
    Fake(FakeBackendConfig),
}

/// How the target peripheral is selected.
#[derive(Debug)]
pub(crate) enum Target {
    Device(DeviceId),
    NamePrefix(String),
    FakeDefault,
}

/// Validated runtime settings derived from CLI arguments.
#[derive(Debug)]
pub(crate) struct RuntimeArgs {
    pub(crate) backend: BackendChoice,
    pub(crate) target: Target,
    pub(crate) discovery_timeout: Duration,
    pub(crate) command: Command,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable styled output.
    Pretty,
    /// Machine-readable JSON output.
    Json,
}

/// Log verbosity override for tracing and log events.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    /// Error-level events only.
    Error,
    /// Warning and error events.
    Warn,
    /// Informational, warning, and error events.
    Info,
    /// Debug and above.
    Debug,
    /// Full trace verbosity.
    Trace,
}

impl LogLevel {
    #[must_use]
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect, report the matched profile and write mode, then disconnect.
    Probe,
    /// Connect and send one or more commands sequentially.
    Send(SendArgs),
    /// Connect, enable streaming, and poll one command until the inactivity
    /// watchdog trips or Ctrl+C.
    Stream(StreamArgs),
}

/// Arguments for the `send` command.
#[derive(Debug, clap::Args)]
pub struct SendArgs {
    /// Response shape: `text`, `bytes`, or `chunked`.
    #[arg(long, value_parser = parse_shape, default_value = "text")]
    shape: ResponseShape,
    /// Per-command timeout (e.g. `4s`, `250ms`).
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
    /// Commands to send, e.g. `ATZ` `010C`.
    #[arg(required = true)]
    commands: Vec<String>,
}

impl SendArgs {
    #[must_use]
    pub(crate) fn shape(&self) -> ResponseShape {
        self.shape
    }

    #[must_use]
    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub(crate) fn commands(&self) -> &[String] {
        &self.commands
    }
}

/// Arguments for the `stream` command.
#[derive(Debug, clap::Args)]
pub struct StreamArgs {
    /// Poll interval between commands.
    #[arg(long, value_parser = parse_duration, default_value = "500ms")]
    interval: Duration,
    /// Stop after this many successful polls.
    #[arg(long)]
    count: Option<usize>,
    /// The command to poll, e.g. `010C`.
    command: String,
}

impl StreamArgs {
    #[must_use]
    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub(crate) fn count(&self) -> Option<usize> {
        self.count
    }

    #[must_use]
    pub(crate) fn command(&self) -> &str {
        &self.command
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

fn parse_shape(value: &str) -> Result<ResponseShape, String> {
    value
        .parse()
        .map_err(|_| "supported shapes are text, bytes, and chunked".to_string())
}
