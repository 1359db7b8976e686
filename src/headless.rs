//! Console mode: transcript lines go to stdout, per-item progress to stderr.

use crate::cli::{spawn_output_writer, OutputLine};
use crate::model::{AppEvent, JobState};
use crate::orchestrator::{EventReceiver, Session};
use anyhow::{bail, Result};
use tracing::info;

/// Drive the session from the main runtime until Ctrl-C, or until the first
/// idle moment after a job finished when `exit_when_idle` is set.
///
/// With `exit_when_idle`, a failed final job is reported as an error so the
/// process exits non-zero.
pub async fn run(mut session: Session, mut events: EventReceiver, exit_when_idle: bool) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();

    // Lines produced while submitting launch arguments.
    for line in session.drain_output() {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                let item = match &ev {
                    AppEvent::Progress { item, .. } => Some(item.clone()),
                    _ => None,
                };
                let finished = matches!(ev, AppEvent::JobFinished { .. });
                session.apply(ev);

                for line in session.drain_output() {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
                if let Some(item) = item {
                    let p = session.progress();
                    let counter = match p.total {
                        Some(total) if total > 0 => format!("{}/{}", p.current, total),
                        _ => p.current.to_string(),
                    };
                    let _ = out_tx.send(OutputLine::Stderr(format!("[{counter}] {item}")));
                }
                if finished && exit_when_idle && !session.is_busy() {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    drop(out_tx);
    let _ = out_handle.await;

    if exit_when_idle {
        if let Some((id, JobState::Failed)) = session.last_job() {
            bail!("classification job {id} failed");
        }
    }
    Ok(())
}
