use std::io;

use owo_colors::OwoColorize;

use crate::cli::OutputFormat;
use crate::cli::command::SendArgs;
use crate::command::CommandResponse;
use crate::session::AdapterSession;
use crate::utils::format_hex;

/// Sends the requested commands sequentially and renders each response.
pub(crate) async fn run<W>(
    session: &AdapterSession,
    args: &SendArgs,
    out: &mut W,
    output: OutputFormat,
) -> anyhow::Result<()>
where
    W: io::Write,
{
    for command in args.commands() {
        let response = session
            .send_with_timeout(command.clone(), args.shape(), args.timeout())
            .await?;
        render_response(out, output, command, &response)?;
    }
    Ok(())
}

fn render_response<W>(
    out: &mut W,
    output: OutputFormat,
    command: &str,
    response: &CommandResponse,
) -> anyhow::Result<()>
where
    W: io::Write,
{
    match output {
        OutputFormat::Json => {
            serde_json::to_writer(
                &mut *out,
                &serde_json::json!({ "command": command, "response": response }),
            )?;
            writeln!(out)?;
        }
        OutputFormat::Pretty => match response {
            CommandResponse::Text(text) => writeln!(out, "{}: {}", command.bold(), text)?,
            CommandResponse::Bytes(bytes) => {
                writeln!(out, "{}: {}", command.bold(), format_hex(bytes))?;
            }
            CommandResponse::Chunked { flat, chunks } => {
                writeln!(out, "{}: {}", command.bold(), format_hex(flat))?;
                for chunk in chunks {
                    writeln!(out, "  {}", format_hex(chunk))?;
                }
            }
        },
    }
    Ok(())
}
