pub mod subprocess;

use crate::model::JobConfig;
use anyhow::Result;
use async_trait::async_trait;

pub use subprocess::SubprocessEngine;

/// Hooks the engine calls while it works. Implementations must be callable
/// from the worker thread.
pub trait EngineCallbacks {
    fn logger(&self, message: &str);
    fn progress_update(&self, item_name: &str, total_count: u64);
}

/// The external classifier.
///
/// The returned future runs to completion on the job's own runtime, so it
/// does not need to be `Send`.
#[async_trait(?Send)]
pub trait Engine: Send + Sync {
    async fn classify(&self, config: &JobConfig, callbacks: &dyn EngineCallbacks) -> Result<()>;
}
