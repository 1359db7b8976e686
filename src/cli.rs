use crate::config::{absolutize, Config, JobDefaults};
use crate::engine::SubprocessEngine;
use crate::ipc::{try_become_primary, Arbitration, Endpoint, Handshake};
use crate::orchestrator::{self, JobRunner, Session};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output line routing for stdout/stderr writer.
pub(crate) enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
pub(crate) fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "trailcam-classifier",
    version,
    about = "Classify trail camera folders; later launches hand their folder to the running instance"
)]
pub struct Cli {
    /// Folders to classify. When another instance is running, the first one is sent to it
    pub paths: Vec<PathBuf>,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Run without the terminal UI; transcript goes to stdout
    #[arg(long)]
    pub headless: bool,

    /// Skip single-instance arbitration entirely
    #[arg(long)]
    pub standalone: bool,

    /// In headless mode, exit once the last job has finished and nothing is running
    #[arg(long, requires = "headless")]
    pub exit_when_idle: bool,

    /// Output directory for classified images
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Model file passed to the classifier
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Confidence threshold in percent
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=100))]
    pub confidence: Option<u32>,

    /// Instance name the rendezvous endpoint is derived from
    #[arg(long)]
    pub instance_name: Option<String>,

    /// How long a running job may take to stop when the app exits
    #[arg(long, default_value = "3s")]
    pub shutdown_grace: humantime::Duration,
}

impl Cli {
    fn wants_tui(&self) -> bool {
        cfg!(feature = "tui") && !self.headless
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let mut cfg = Config::resolve(args.config.as_deref())?;
    apply_overrides(&mut cfg, &args)?;

    let log_file = cfg.logging.resolve_file_path();
    let _guard = init_logging(&args, &cfg, log_file.as_deref())?;
    if !cfg!(feature = "tui") && !args.headless {
        warn!("built without terminal UI support; running headless");
    }

    let launch_arg = match args.paths.first() {
        Some(p) => Some(absolutize(p)?.display().to_string()),
        None => None,
    };

    let handshake = Handshake::from(&cfg.ipc);
    let arbitration = if args.standalone {
        Arbitration::Standalone
    } else {
        match Endpoint::resolve(&cfg.app.instance_name, &cfg.ipc) {
            Ok(endpoint) => try_become_primary(&endpoint, launch_arg.as_deref(), handshake).await,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "no rendezvous endpoint; running standalone");
                Arbitration::Standalone
            }
        }
    };
    info!(role = arbitration.role(), "instance arbitration finished");

    let mut primary = match arbitration {
        Arbitration::Secondary => {
            if !args.wants_tui() {
                eprintln!("Handed over to the running trailcam-classifier instance.");
            }
            return Ok(());
        }
        Arbitration::Primary(handle) => Some(handle),
        Arbitration::Standalone => None,
    };

    let (bridge, events) = orchestrator::channel();
    let engine = Arc::new(SubprocessEngine::new(&cfg.engine)?);
    let runner = JobRunner::new(engine, bridge.clone());
    let defaults = JobDefaults::from_config(&cfg.classifier)?;
    info!(
        output = %defaults.output.display(),
        model = %defaults.model.display(),
        threshold = defaults.confidence_threshold,
        "job defaults"
    );
    let mut session = Session::new(runner.clone(), defaults);

    if let Some(handle) = primary.as_mut() {
        handle.serve(bridge.clone(), handshake.read_timeout);
    }
    drop(bridge);

    submit_launch_paths(&mut session, &args.paths);

    let res = if args.wants_tui() {
        run_ui(session, events).await
    } else {
        crate::headless::run(session, events, args.exit_when_idle).await
    };

    // Unregister first so new launches do not forward into a closing instance.
    if let Some(handle) = primary {
        handle.close();
    }
    let grace = Duration::from(args.shutdown_grace);
    tokio::task::spawn_blocking(move || runner.shutdown(grace))
        .await
        .context("job shutdown task failed")?;

    res
}

#[cfg(feature = "tui")]
async fn run_ui(session: Session, events: orchestrator::EventReceiver) -> Result<()> {
    crate::tui::run(session, events).await
}

#[cfg(not(feature = "tui"))]
async fn run_ui(session: Session, events: orchestrator::EventReceiver) -> Result<()> {
    // Fallback when built without TUI support.
    crate::headless::run(session, events, false).await
}

/// Every launch path that is an existing folder joins one initial job.
fn submit_launch_paths(session: &mut Session, paths: &[PathBuf]) {
    let mut dirs = Vec::new();
    for p in paths {
        if p.is_dir() {
            dirs.push(p.clone());
        } else if p.exists() {
            warn!(path = %p.display(), "ignoring launch argument that is not a folder");
        } else {
            warn!(path = %p.display(), "ignoring launch argument that does not exist");
        }
    }
    if !dirs.is_empty() {
        session.submit(dirs);
    }
}

fn apply_overrides(cfg: &mut Config, args: &Cli) -> Result<()> {
    if let Some(name) = &args.instance_name {
        cfg.app.instance_name = name.clone();
    }
    if let Some(level) = &args.log_level {
        cfg.logging.level = level.clone();
    }
    if let Some(p) = &args.output {
        cfg.classifier.output_directory = path_setting(p)?;
    }
    if let Some(p) = &args.model {
        cfg.classifier.model_path = path_setting(p)?;
    }
    if let Some(c) = args.confidence {
        cfg.classifier.confidence_threshold = c;
    }
    cfg.validate()
}

fn path_setting(p: &Path) -> Result<String> {
    p.to_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", p.display()))
}

fn init_logging(args: &Cli, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));

    // A stderr layer would scribble over the alternate screen.
    let stderr_layer = if args.wants_tui() {
        None
    } else if cfg.logging.json {
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed(),
        )
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed(),
        )
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir: {}", parent.display()))?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = if cfg.logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true)
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_config() {
        let args = Cli::parse_from([
            "trailcam-classifier",
            "--headless",
            "--confidence",
            "80",
            "--instance-name",
            "TestInstance",
            "--output",
            "/srv/out",
            "/data/photos",
        ]);
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, &args).unwrap();
        assert_eq!(cfg.classifier.confidence_threshold, 80);
        assert_eq!(cfg.app.instance_name, "TestInstance");
        assert_eq!(cfg.classifier.output_directory, "/srv/out");
        assert_eq!(args.paths, vec![PathBuf::from("/data/photos")]);
        assert!(!args.wants_tui());
    }

    #[test]
    fn confidence_above_100_is_rejected() {
        let res = Cli::try_parse_from(["trailcam-classifier", "--confidence", "150"]);
        assert!(res.is_err());
    }

    #[test]
    fn exit_when_idle_needs_headless() {
        let res = Cli::try_parse_from(["trailcam-classifier", "--exit-when-idle"]);
        assert!(res.is_err());
    }
}
