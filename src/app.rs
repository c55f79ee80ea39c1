use std::io;
use std::sync::Arc;

use anyhow::Result;

use crate::ble::{BleTransport, BtleplugBackend, DeviceId, FakeBackend};
use crate::cli::command::{BackendChoice, RuntimeArgs, Target};
use crate::cli::{Args, Command, LogLevel, OutputFormat};
use crate::config::SessionConfig;
use crate::error::CliConfigError;
use crate::session::AdapterSession;
use crate::telemetry;

enum ResolvedBackend {
    Real(Arc<BtleplugBackend>),
    Fake(FakeBackend),
}

/// Runs the CLI with already parsed arguments.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = elmlink::Args::try_parse_from([
///     "elmlink",
///     "--fake",
///     "--fake-replies",
///     "454c4d333237203e",
///     "send",
///     "ATI",
/// ])?;
/// let mut out = Vec::new();
/// elmlink::run(args, &mut out).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, CLI backend
/// configuration is invalid, the session rejects an operation, or output
/// writing fails.
pub async fn run<W>(args: Args, out: &mut W) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing("elmlink", args.log_level().map(LogLevel::as_level_filter))?;
    let output = args.output_format().unwrap_or(OutputFormat::Pretty);
    let RuntimeArgs {
        backend,
        target,
        discovery_timeout,
        command,
    } = args.into_runtime()?;

    let resolved = match backend {
        BackendChoice::Fake(config) => ResolvedBackend::Fake(FakeBackend::new(config)),
        BackendChoice::Real => ResolvedBackend::Real(Arc::new(BtleplugBackend::new().await?)),
    };
    let transport: Arc<dyn BleTransport> = match &resolved {
        ResolvedBackend::Fake(fake) => Arc::new(fake.clone()),
        ResolvedBackend::Real(backend) => backend.clone(),
    };

    let session = AdapterSession::new(transport, SessionConfig::default());
    session.initialize().await?;

    let device = resolve_target(&resolved, target, discovery_timeout).await?;
    let profile = session.connect(device).await?;

    let command_result = match command {
        Command::Probe => crate::cli::probe::run(&profile, out, output),
        Command::Send(args) => crate::cli::send::run(&session, &args, out, output).await,
        Command::Stream(args) => crate::cli::stream::run(&session, &args, out, output).await,
    };

    let disconnect_result = session.disconnect().await;
    session.shutdown();

    command_result?;
    disconnect_result?;
    Ok(())
}

async fn resolve_target(
    backend: &ResolvedBackend,
    target: Target,
    discovery_timeout: std::time::Duration,
) -> Result<DeviceId> {
    match (backend, target) {
        (_, Target::Device(device)) => Ok(device),
        (ResolvedBackend::Fake(fake), Target::FakeDefault) => Ok(fake.device_id()),
        (ResolvedBackend::Real(backend), Target::NamePrefix(prefix)) => {
            Ok(backend.find_device(&prefix, discovery_timeout).await?)
        }
        (ResolvedBackend::Real(_), Target::FakeDefault)
        | (ResolvedBackend::Fake(_), Target::NamePrefix(_)) => {
            Err(CliConfigError::MissingDeviceSelector.into())
        }
    }
}
