pub mod cli;
pub mod config;
pub mod engine;
pub mod headless;
pub mod ipc;
pub mod model;
pub mod orchestrator;
pub mod progress;
#[cfg(feature = "tui")]
pub mod tui;
