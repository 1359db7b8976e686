use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Everything the engine needs for one run. Immutable once the job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub dirs: Vec<PathBuf>,
    pub output: PathBuf,
    pub model: PathBuf,
    pub confidence_threshold: f64,
}

impl JobConfig {
    pub fn new(
        dirs: Vec<PathBuf>,
        output: PathBuf,
        model: PathBuf,
        confidence_threshold: f64,
    ) -> anyhow::Result<Self> {
        if dirs.is_empty() {
            anyhow::bail!("a job needs at least one input directory");
        }
        if !(0.0..=1.0).contains(&confidence_threshold) {
            anyhow::bail!(
                "confidence threshold must be within 0.0..=1.0, got {}",
                confidence_threshold
            );
        }
        Ok(Self {
            dirs,
            output,
            model,
            confidence_threshold,
        })
    }

    /// Input directories joined for display.
    pub fn dirs_display(&self) -> String {
        self.dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Events delivered to the interactive thread through the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// One transcript line, in emission order.
    Log(String),
    /// The engine finished one item; `total` is its current estimate.
    Progress { item: String, total: u64 },
    /// Posted by the runner before the worker exists, so it precedes every worker event.
    JobStarted { id: JobId, dirs: Vec<PathBuf> },
    JobFinished { id: JobId, state: JobState },
    /// A path handed over by a secondary instance.
    PathForwarded(String),
}
