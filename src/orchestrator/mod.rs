//! Application-level orchestration.
//!
//! This module owns the job lifecycle (one job at a time, each on its own worker),
//! the bridge that carries worker events back to the interactive thread, and the
//! session state that thread keeps. UI/CLI layers call into this module to keep
//! responsibilities separated.

mod bridge;
mod runner;
mod session;

pub use bridge::{channel, EventBridge, EventReceiver};
pub use runner::{Job, JobRunner};
pub use session::{parse_dropped_path, Session, ALREADY_RUNNING, FINISHED, NOT_A_FOLDER};
