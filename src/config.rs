use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Output folder used when none is configured.
pub const DEFAULT_OUTPUT_DIRECTORY: &str = "images_with_objects_detected";
/// Model location relative to the executable's directory.
pub const DEFAULT_MODEL_PATH: &str = "model/trailcam_classifier_model.pt";
pub const DEFAULT_INSTANCE_NAME: &str = "TrailcamClassifierApp";

const APP_DIR: &str = "trailcam-classifier";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub classifier: Classifier,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit path, else the per-user config file if present,
    /// else built-in defaults.
    pub fn resolve(user: Option<&Path>) -> Result<Self> {
        if let Some(p) = user {
            return Self::load(p);
        }
        match default_config_path() {
            Some(p) if p.exists() => Self::load(&p),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.classifier.confidence_threshold > 100 {
            anyhow::bail!(
                "classifier.confidence_threshold must be a percentage (0-100), got {}",
                self.classifier.confidence_threshold
            );
        }
        if self.engine.command.is_empty() {
            anyhow::bail!("engine.command must name a program");
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    /// Application identity; the rendezvous endpoint is derived from it.
    pub instance_name: String,
}
impl Default for App {
    fn default() -> Self {
        Self {
            instance_name: DEFAULT_INSTANCE_NAME.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcTransport {
    Auto,
    Unix,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub transport: IpcTransport,
    pub socket_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}
impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            transport: IpcTransport::Auto,
            socket_dir: PathBuf::new(),
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Classifier {
    pub output_directory: String,
    pub model_path: String,
    /// Percent, 0..=100.
    pub confidence_threshold: u32,
}
impl Default for Classifier {
    fn default() -> Self {
        Self {
            output_directory: String::new(),
            model_path: String::new(),
            confidence_threshold: 65,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "python3".into(),
                "-m".into(),
                "trailcam_classifier.main".into(),
            ],
            env: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: true,
            file_path: "".into(),
        }
    }
}

impl Logging {
    pub fn resolve_file_path(&self) -> Option<PathBuf> {
        if !self.write_to_file {
            return None;
        }
        if !self.file_path.is_empty() {
            return Some(PathBuf::from(&self.file_path));
        }
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Some(base.join(APP_DIR).join("trailcam-classifier.log"))
    }
}

/// Settings applied to every submitted job, resolved to absolute paths.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefaults {
    pub output: PathBuf,
    pub model: PathBuf,
    pub confidence_threshold: f64,
}

impl JobDefaults {
    pub fn from_config(cfg: &Classifier) -> Result<Self> {
        let output = if cfg.output_directory.is_empty() {
            PathBuf::from(DEFAULT_OUTPUT_DIRECTORY)
        } else {
            PathBuf::from(&cfg.output_directory)
        };
        let model = if cfg.model_path.is_empty() {
            resource_dir().join(DEFAULT_MODEL_PATH)
        } else {
            PathBuf::from(&cfg.model_path)
        };
        Ok(Self {
            output: absolutize(&output)?,
            model,
            confidence_threshold: f64::from(cfg.confidence_threshold.min(100)) / 100.0,
        })
    }
}

/// Resolve `p` against the current directory without touching symlinks.
pub fn absolutize(p: &Path) -> Result<PathBuf> {
    if p.is_absolute() {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir().with_context(|| "current_dir")?;
    Ok(cwd.join(p))
}

/// Directory bundled resources are looked up in: next to the executable,
/// falling back to the working directory.
fn resource_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
