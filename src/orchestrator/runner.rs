//! Job lifecycle.
//!
//! At most one job runs at a time. Each job gets its own OS thread with its
//! own current-thread runtime, so the engine's async work never competes with
//! the interactive thread.

use super::bridge::EventBridge;
use crate::engine::{Engine, EngineCallbacks};
use crate::model::{AppEvent, JobConfig, JobId, JobState};
use anyhow::{anyhow, Context, Result};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// A snapshot of the current or most recent job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub config: Arc<JobConfig>,
    pub state: JobState,
    pub created_at: OffsetDateTime,
}

/// Owns the single "current job" slot and the worker behind it.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn Engine>,
    bridge: EventBridge,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    next_id: u64,
    current: Option<ActiveJob>,
}

struct ActiveJob {
    job: Job,
    worker: Option<JoinHandle<()>>,
    abort: Option<oneshot::Sender<()>>,
}

impl ActiveJob {
    /// A worker that exited without reporting back is treated as failed.
    /// Returns true when this call made that transition.
    fn reap_dead_worker(&mut self) -> bool {
        let dead = self.job.state == JobState::Running
            && self.worker.as_ref().is_some_and(|h| h.is_finished());
        if dead {
            self.job.state = JobState::Failed;
            self.abort = None;
        }
        dead
    }
}

impl JobRunner {
    pub fn new(engine: Arc<dyn Engine>, bridge: EventBridge) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                bridge,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Start `config` on a fresh worker. Returns false, without side effects,
    /// while another job is still running.
    ///
    /// Never waits for the job: the worker reports through the bridge.
    pub fn start(&self, config: JobConfig) -> bool {
        let mut slot = self.inner.lock();
        if let Some(active) = slot.current.as_mut() {
            if active.reap_dead_worker() {
                self.inner.report_dead_worker(active.job.id);
            }
            if active.job.state == JobState::Running {
                debug!(running = %active.job.id, "start rejected; a job is already running");
                return false;
            }
        }

        slot.next_id += 1;
        let id = JobId(slot.next_id);
        let config = Arc::new(config);
        let mut job = Job {
            id,
            config: Arc::clone(&config),
            state: JobState::Idle,
            created_at: OffsetDateTime::now_utc(),
        };

        // Posted before the worker exists so consumers reset before any job output.
        self.inner.bridge.post(AppEvent::JobStarted {
            id,
            dirs: config.dirs.clone(),
        });

        let (abort_tx, abort_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("classifier-job-{}", id.0))
            .spawn(move || run_worker(inner, id, config, abort_rx));

        match spawned {
            Ok(handle) => {
                job.state = JobState::Running;
                info!(job = %id, dirs = %job.config.dirs_display(), "job started");
                slot.current = Some(ActiveJob {
                    job,
                    worker: Some(handle),
                    abort: Some(abort_tx),
                });
                true
            }
            Err(e) => {
                error!(job = %id, error = %e, "could not spawn worker thread");
                job.state = JobState::Failed;
                slot.current = Some(ActiveJob {
                    job,
                    worker: None,
                    abort: None,
                });
                self.inner
                    .bridge
                    .post_log(format!("An error occurred:\nfailed to start worker thread: {e}"));
                self.inner.bridge.post(AppEvent::JobFinished {
                    id,
                    state: JobState::Failed,
                });
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let mut slot = self.inner.lock();
        match slot.current.as_mut() {
            Some(active) => {
                if active.reap_dead_worker() {
                    self.inner.report_dead_worker(active.job.id);
                }
                active.job.state == JobState::Running
            }
            None => false,
        }
    }

    /// The current job, or the most recent one once it has finished.
    pub fn current(&self) -> Option<Job> {
        self.inner.lock().current.as_ref().map(|a| a.job.clone())
    }

    /// Ask a running job to stop and wait up to `grace` for its thread.
    ///
    /// Only used when the application exits; there is no user-facing cancel.
    pub fn shutdown(&self, grace: Duration) {
        let worker = {
            let mut slot = self.inner.lock();
            let Some(active) = slot.current.as_mut() else {
                return;
            };
            if active.job.state != JobState::Running {
                return;
            }
            warn!(job = %active.job.id, "stopping running job for shutdown");
            if let Some(abort) = active.abort.take() {
                let _ = abort.send(());
            }
            active.worker.take()
        };

        let Some(handle) = worker else {
            return;
        };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("job worker did not stop within {:?}; leaving it behind", grace);
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        if handle.join().is_err() {
            warn!("job worker panicked during shutdown");
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the final state and tell the consumer. Runs on the worker.
    ///
    /// The post happens under the slot lock, so a `start` racing with this
    /// call cannot put its `JobStarted` ahead of our `JobFinished`.
    fn finish(&self, id: JobId, state: JobState) {
        let mut slot = self.lock();
        if let Some(active) = slot.current.as_mut().filter(|a| a.job.id == id) {
            active.job.state = state;
            active.abort = None;
        }
        self.bridge.post(AppEvent::JobFinished { id, state });
    }

    fn report_dead_worker(&self, id: JobId) {
        error!(job = %id, "job worker exited without reporting a result");
        self.bridge
            .post_log("An error occurred:\nthe classification worker stopped unexpectedly");
        self.bridge.post(AppEvent::JobFinished {
            id,
            state: JobState::Failed,
        });
    }
}

/// Routes engine callbacks from the worker thread into the bridge.
struct BridgeCallbacks {
    bridge: EventBridge,
}

impl EngineCallbacks for BridgeCallbacks {
    fn logger(&self, message: &str) {
        self.bridge.post_log(message);
    }

    fn progress_update(&self, item_name: &str, total_count: u64) {
        self.bridge.post_progress(item_name, total_count);
    }
}

fn run_worker(
    inner: Arc<Inner>,
    id: JobId,
    config: Arc<JobConfig>,
    abort: oneshot::Receiver<()>,
) {
    let callbacks = BridgeCallbacks {
        bridge: inner.bridge.clone(),
    };
    let started = Instant::now();
    let outcome = drive(inner.engine.as_ref(), &config, &callbacks, abort);

    let state = match &outcome {
        Ok(()) => {
            info!(job = %id, elapsed = ?started.elapsed(), "job completed");
            JobState::Completed
        }
        Err(e) => {
            error!(job = %id, "job failed: {e:#}");
            inner.bridge.post_log(format!("An error occurred:\n{e:?}"));
            JobState::Failed
        }
    };
    inner.finish(id, state);
}

/// Run the engine to completion on a runtime owned by this thread.
fn drive(
    engine: &dyn Engine,
    config: &JobConfig,
    callbacks: &dyn EngineCallbacks,
    abort: oneshot::Receiver<()>,
) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building job runtime")?;

    rt.block_on(async {
        let job = AssertUnwindSafe(engine.classify(config, callbacks)).catch_unwind();
        tokio::select! {
            res = job => match res {
                Ok(r) => r,
                Err(panic) => Err(anyhow!("classifier panicked: {}", panic_message(panic.as_ref()))),
            },
            Ok(()) = abort => Err(anyhow!("aborted: application shutting down")),
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
