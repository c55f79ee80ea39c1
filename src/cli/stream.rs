use std::io;

use tracing::debug;

use crate::cli::OutputFormat;
use crate::cli::command::StreamArgs;
use crate::command::{CommandResponse, ResponseShape};
use crate::error::{ErrorKind, SessionError};
use crate::session::AdapterSession;

/// Polls one command on an interval while streaming is enabled, until the
/// inactivity watchdog trips, the requested count is reached, or Ctrl+C.
pub(crate) async fn run<W>(
    session: &AdapterSession,
    args: &StreamArgs,
    out: &mut W,
    output: OutputFormat,
) -> anyhow::Result<()>
where
    W: io::Write,
{
    let mut subscription = session.subscribe().await?;
    session.set_streaming(true).await?;
    let mut ticker = tokio::time::interval(args.interval());
    let mut polls = 0usize;

    let stop_reason = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break "interrupted by user";
            }
            maybe_snapshot = subscription.next() => match maybe_snapshot {
                Some(snapshot)
                    if !snapshot.streaming()
                        && snapshot.last_error() == Some(ErrorKind::StreamingInactive) =>
                {
                    break "stopped by inactivity watchdog";
                }
                Some(_) => {}
                None => break "session stopped",
            },
            _ = ticker.tick() => {
                match session.send(args.command().to_string(), ResponseShape::Text).await {
                    Ok(CommandResponse::Text(text)) => {
                        polls += 1;
                        writeln!(out, "{text}")?;
                        if args.count().is_some_and(|count| polls >= count) {
                            break "reached requested poll count";
                        }
                    }
                    Ok(_) => {}
                    Err(SessionError::CommandPending) => {
                        debug!("previous poll still in flight; skipping tick");
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }
    };

    let _ = session.set_streaming(false).await;

    match output {
        OutputFormat::Json => {
            serde_json::to_writer(
                &mut *out,
                &serde_json::json!({ "polls": polls, "stopped": stop_reason }),
            )?;
            writeln!(out)?;
        }
        OutputFormat::Pretty => {
            writeln!(out, "{polls} polls; {stop_reason}")?;
        }
    }
    Ok(())
}
