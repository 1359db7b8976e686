//! What the interactive thread owns: the transcript, progress, and the
//! entry points that turn user input into jobs.

use super::runner::JobRunner;
use crate::config::{absolutize, JobDefaults};
use crate::model::{AppEvent, JobConfig, JobId, JobState};
use crate::progress::{ProgressAggregator, ProgressState};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use url::Url;

pub const ALREADY_RUNNING: &str = "A classification process is already running.";
pub const NOT_A_FOLDER: &str = "Please drop a folder, not a file.";
pub const FINISHED: &str = "Classification finished.";

/// Oldest lines are dropped past this many.
const MAX_TRANSCRIPT_LINES: usize = 10_000;

pub struct Session {
    runner: JobRunner,
    defaults: JobDefaults,
    transcript: Vec<String>,
    pending: Vec<String>,
    progress: ProgressAggregator,
    current_item: Option<String>,
    last_job: Option<(JobId, JobState)>,
    finished_jobs: u64,
}

impl Session {
    pub fn new(runner: JobRunner, defaults: JobDefaults) -> Self {
        Self {
            runner,
            defaults,
            transcript: Vec::new(),
            pending: Vec::new(),
            progress: ProgressAggregator::new(),
            current_item: None,
            last_job: None,
            finished_jobs: 0,
        }
    }

    /// Start one job over `paths` with the session's defaults.
    pub fn submit(&mut self, paths: Vec<PathBuf>) -> bool {
        let dirs = match paths.iter().map(|p| absolutize(p)).collect::<anyhow::Result<Vec<_>>>() {
            Ok(d) => d,
            Err(e) => {
                self.push_line(format!("An error occurred:\n{e:#}"));
                return false;
            }
        };
        let config = match JobConfig::new(
            dirs,
            self.defaults.output.clone(),
            self.defaults.model.clone(),
            self.defaults.confidence_threshold,
        ) {
            Ok(c) => c,
            Err(e) => {
                self.push_line(format!("An error occurred:\n{e:#}"));
                return false;
            }
        };

        if self.runner.start(config) {
            true
        } else {
            self.push_line(ALREADY_RUNNING);
            false
        }
    }

    /// Handle a path that was pasted, dropped, typed or forwarded by
    /// another instance. Only existing directories start a job.
    pub fn submit_dropped(&mut self, raw: &str) -> bool {
        let Some(path) = parse_dropped_path(raw) else {
            if raw.trim().is_empty() {
                debug!("ignoring empty drop");
            } else {
                self.push_line(format!("Not a local folder: {}", raw.trim()));
            }
            return false;
        };
        if path.is_dir() {
            self.submit(vec![path])
        } else if path.exists() {
            self.push_line(NOT_A_FOLDER);
            false
        } else {
            self.push_line(format!("Path does not exist: {}", path.display()));
            false
        }
    }

    pub fn apply(&mut self, event: AppEvent) {
        match event {
            AppEvent::Log(line) => self.push_line(line),
            AppEvent::Progress { item, total } => {
                self.progress.on_item(total);
                self.current_item = Some(item);
            }
            AppEvent::JobStarted { id, dirs } => {
                self.transcript.clear();
                self.progress.reset();
                self.current_item = None;
                self.last_job = Some((id, JobState::Running));
                let joined = dirs
                    .iter()
                    .map(|d| d.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.push_line(format!("Starting classification for folder: {joined}"));
            }
            AppEvent::JobFinished { id, state } => {
                if self.last_job.is_some_and(|(current, _)| current != id) {
                    warn!(job = %id, "ignoring finish for a job that is not current");
                    return;
                }
                self.last_job = Some((id, state));
                self.finished_jobs += 1;
                self.current_item = None;
                if state == JobState::Completed {
                    self.push_line(FINISHED);
                }
            }
            AppEvent::PathForwarded(raw) => {
                info!(path = %raw, "path forwarded by another instance");
                self.submit_dropped(&raw);
            }
        }
    }

    /// Lines appended since the previous call, oldest first.
    pub fn drain_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    pub fn progress(&self) -> ProgressState {
        self.progress.state()
    }

    pub fn current_item(&self) -> Option<&str> {
        self.current_item.as_deref()
    }

    pub fn last_job(&self) -> Option<(JobId, JobState)> {
        self.last_job
    }

    pub fn finished_jobs(&self) -> u64 {
        self.finished_jobs
    }

    pub fn is_busy(&self) -> bool {
        self.runner.is_running()
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    fn push_line(&mut self, line: impl Into<String>) {
        let line = line.into();
        if self.transcript.len() >= MAX_TRANSCRIPT_LINES {
            let excess = self.transcript.len() + 1 - MAX_TRANSCRIPT_LINES;
            self.transcript.drain(..excess);
        }
        self.pending.push(line.clone());
        self.transcript.push(line);
    }
}

/// Normalize what a terminal or file manager hands over for a dropped path.
///
/// Terminals paste dropped files as quoted paths, backslash-escaped paths or
/// `file://` URIs depending on the emulator. URIs naming another host are
/// not local folders and yield `None`.
pub fn parse_dropped_path(raw: &str) -> Option<PathBuf> {
    let mut s = raw.trim();
    for q in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            s = &s[1..s.len() - 1];
        }
    }
    if s.is_empty() {
        return None;
    }

    if s.starts_with("file:") {
        let uri = match Url::parse(s) {
            Ok(u) => u,
            Err(e) => {
                warn!(uri = %s, error = %e, "malformed file URI");
                return None;
            }
        };
        return match uri.to_file_path() {
            Ok(path) => Some(path),
            Err(()) => {
                warn!(uri = %s, host = ?uri.host_str(), "file URI does not name a local path");
                None
            }
        };
    }

    let unescaped = s.replace("\\ ", " ");
    Some(PathBuf::from(unescaped))
}
