use std::io;

use owo_colors::OwoColorize;

use crate::cli::OutputFormat;
use crate::session::ConnectedProfile;

/// Reports the profile resolved by the handshake.
pub(crate) fn run<W>(
    profile: &ConnectedProfile,
    out: &mut W,
    output: OutputFormat,
) -> anyhow::Result<()>
where
    W: io::Write,
{
    match output {
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, profile)?;
            writeln!(out)?;
        }
        OutputFormat::Pretty => {
            writeln!(out, "device:     {}", profile.device())?;
            writeln!(out, "profile:    {}", profile.profile().green())?;
            writeln!(out, "write mode: {}", profile.write_mode())?;
        }
    }
    Ok(())
}
