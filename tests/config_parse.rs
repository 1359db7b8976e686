use std::time::Duration;
use trailcam_classifier::config::{Config, IpcTransport, DEFAULT_INSTANCE_NAME};

#[test]
fn parse_example_config() {
    let raw = include_str!("../trailcam-classifier.example.toml");
    let cfg: Config = toml::from_str(raw).expect("parse TOML");
    cfg.validate().expect("example config is valid");
    assert_eq!(cfg.app.instance_name, DEFAULT_INSTANCE_NAME);
    assert_eq!(cfg.ipc.transport, IpcTransport::Auto);
    assert_eq!(cfg.ipc.connect_timeout, Duration::from_millis(500));
    assert_eq!(cfg.classifier.confidence_threshold, 65);
    assert!(!cfg.engine.command.is_empty());
    assert!(cfg.engine.env.is_empty());
}

#[test]
fn load_from_file_and_reject_bad_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.toml");
    std::fs::write(&good, "[ipc]\ntransport = \"tcp\"\nread_timeout = \"250ms\"\n").unwrap();
    let cfg = Config::resolve(Some(good.as_path())).unwrap();
    assert_eq!(cfg.ipc.transport, IpcTransport::Tcp);
    assert_eq!(cfg.ipc.read_timeout, Duration::from_millis(250));

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[classifier]\nconfidence_threshold = 101\n").unwrap();
    assert!(Config::load(&bad).is_err());

    assert!(Config::load(&dir.path().join("missing.toml")).is_err());
}
