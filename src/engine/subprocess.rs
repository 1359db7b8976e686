use super::{Engine, EngineCallbacks};
use crate::config::EngineConfig;
use crate::model::JobConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Keep only the end of stderr; that is where tracebacks finish.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// One line of the classifier's stdout protocol.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineLine {
    Log { message: String },
    Progress { item: String, total: u64 },
}

/// Runs the classifier as a child process.
///
/// The job config goes to stdin as JSON. Stdout carries one JSON event per
/// line; anything else printed there is treated as a log line.
pub struct SubprocessEngine {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl SubprocessEngine {
    pub fn new(cfg: &EngineConfig) -> Result<Self> {
        let (program, args) = cfg
            .command
            .split_first()
            .ok_or_else(|| anyhow!("engine.command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: cfg.env.clone(),
        })
    }
}

#[async_trait(?Send)]
impl Engine for SubprocessEngine {
    async fn classify(&self, config: &JobConfig, callbacks: &dyn EngineCallbacks) -> Result<()> {
        debug!(program = %self.program, args = ?self.args, "spawning classifier");
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning classifier: {}", self.program))?;

        {
            let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
            let bytes = serde_json::to_vec(config)?;
            // A child that exits without reading its input reports through its exit status.
            if let Err(e) = stdin.write_all(&bytes).await {
                debug!(error = %e, "classifier did not accept the job on stdin");
            }
            stdin.write_all(b"\n").await.ok();
            stdin.shutdown().await.ok();
        }

        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("no stderr"))?;

        // Drain stderr alongside stdout so a chatty child cannot block on a full pipe.
        let stderr_task = async move {
            let mut buf = Vec::new();
            let mut reader = stderr;
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.len() > STDERR_TAIL_BYTES {
                            let excess = buf.len() - STDERR_TAIL_BYTES;
                            buf.drain(..excess);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "reading classifier stderr");
                        break;
                    }
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        // Lines are read as bytes; a filename in a legacy encoding must not end the job.
        let stdout_task = async {
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                let n = reader
                    .read_until(b'\n', &mut line)
                    .await
                    .context("reading classifier output")?;
                if n == 0 {
                    break;
                }
                dispatch_line(&String::from_utf8_lossy(&line), callbacks);
            }
            Ok::<(), anyhow::Error>(())
        };

        let (stdout_res, stderr_text) = tokio::join!(stdout_task, stderr_task);
        let status = child.wait().await.context("waiting for classifier")?;
        stdout_res?;

        if !stderr_text.trim().is_empty() {
            debug!(stderr = %stderr_text.trim(), "classifier stderr");
        }
        if !status.success() {
            return Err(anyhow!(
                "classifier exited with {}\n{}",
                status,
                stderr_text.trim_end()
            ));
        }
        Ok(())
    }
}

fn dispatch_line(line: &str, callbacks: &dyn EngineCallbacks) {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return;
    }
    match serde_json::from_str::<EngineLine>(trimmed) {
        Ok(EngineLine::Log { message }) => callbacks.logger(&message),
        Ok(EngineLine::Progress { item, total }) => callbacks.progress_update(&item, total),
        Err(_) => callbacks.logger(trimmed),
    }
}
