//! Startup arbitration between instances of the application.
//!
//! Connect first; on failure claim the endpoint and bind. Claiming clears a
//! socket file left by a dead primary. If another instance owns the
//! endpoint, keep connecting until the connect timeout runs out, since the
//! owner may still be binding. If nothing works, run standalone instead of
//! blocking.

use super::channel::{self, ChannelError};
use super::endpoint::{Endpoint, Listener, OwnerLock};
use crate::config::IpcConfig;
use crate::model::AppEvent;
use crate::orchestrator::EventBridge;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RETRY_PAUSE: Duration = Duration::from_millis(25);

/// Bounded waits used during the handshake.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
}

impl From<&IpcConfig> for Handshake {
    fn from(ipc: &IpcConfig) -> Self {
        Self {
            connect_timeout: ipc.connect_timeout,
            write_timeout: ipc.write_timeout,
            read_timeout: ipc.read_timeout,
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::from(&IpcConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("forwarding failed: {0}")]
    Forward(#[from] ChannelError),
}

/// Outcome of startup arbitration.
pub enum Arbitration {
    /// This process owns the endpoint.
    Primary(PrimaryHandle),
    /// Another instance owns the endpoint and has received our argument.
    Secondary,
    /// The endpoint could not be claimed or reached; run without it.
    Standalone,
}

impl Arbitration {
    pub fn role(&self) -> &'static str {
        match self {
            Arbitration::Primary(_) => "primary",
            Arbitration::Secondary => "secondary",
            Arbitration::Standalone => "standalone",
        }
    }
}

/// Decide whether this process is the primary instance.
///
/// A secondary hands `launch_arg` to the primary before returning. Errors
/// along the way are recovered here and never reach the caller.
pub async fn try_become_primary(
    endpoint: &Endpoint,
    launch_arg: Option<&str>,
    handshake: Handshake,
) -> Arbitration {
    match forward(endpoint, launch_arg, handshake).await {
        Ok(()) => {
            info!(%endpoint, "primary instance found; argument forwarded");
            return Arbitration::Secondary;
        }
        Err(e) => debug!(%endpoint, error = %e, "no primary instance reachable"),
    }

    match endpoint.try_bind() {
        Ok((listener, owner)) => return primary(endpoint, listener, owner),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            debug!(%endpoint, "endpoint taken; retrying connect");
        }
        Err(e) => {
            warn!(%endpoint, error = %e, "cannot bind endpoint; running standalone");
            return Arbitration::Standalone;
        }
    }

    match forward_until(endpoint, launch_arg, handshake).await {
        Ok(()) => {
            info!(%endpoint, "lost bind race; argument forwarded to winner");
            return Arbitration::Secondary;
        }
        Err(e) => debug!(%endpoint, error = %e, "retry connect failed"),
    }

    // Owned but unreachable: a hung primary, or a foreign process on the port.
    warn!(%endpoint, "running standalone; later launches will not be forwarded here");
    Arbitration::Standalone
}

/// Retry [`forward`] while connecting fails, until the connect timeout runs
/// out. A failure after connecting is final.
async fn forward_until(
    endpoint: &Endpoint,
    launch_arg: Option<&str>,
    handshake: Handshake,
) -> Result<(), RendezvousError> {
    let deadline = Instant::now() + handshake.connect_timeout;
    loop {
        match forward(endpoint, launch_arg, handshake).await {
            Err(RendezvousError::Connect(_)) if Instant::now() < deadline => {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            res => return res,
        }
    }
}

/// Connect and, if there is one, send the launch argument.
async fn forward(
    endpoint: &Endpoint,
    launch_arg: Option<&str>,
    handshake: Handshake,
) -> Result<(), RendezvousError> {
    let mut conn = endpoint
        .try_connect(handshake.connect_timeout)
        .await
        .map_err(RendezvousError::Connect)?;
    if let Some(arg) = launch_arg {
        channel::send(&mut conn, arg, handshake.write_timeout).await?;
    }
    Ok(())
}

fn primary(endpoint: &Endpoint, listener: Listener, owner: Option<OwnerLock>) -> Arbitration {
    info!(%endpoint, "became primary instance");
    Arbitration::Primary(PrimaryHandle {
        endpoint: endpoint.clone(),
        listener: Some(listener),
        task: None,
        owner,
    })
}

/// Ownership of the rendezvous endpoint. Dropping it unregisters the endpoint.
pub struct PrimaryHandle {
    endpoint: Endpoint,
    listener: Option<Listener>,
    task: Option<JoinHandle<()>>,
    owner: Option<OwnerLock>,
}

impl PrimaryHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Start accepting forwarded paths. Each non-empty message becomes an
    /// [`AppEvent::PathForwarded`] on `bridge`. Calling this twice is a no-op.
    pub fn serve(&mut self, bridge: EventBridge, read_timeout: Duration) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        self.task = Some(tokio::spawn(accept_loop(listener, bridge, read_timeout)));
    }

    /// Stop listening and unregister the endpoint.
    pub fn close(mut self) {
        self.shutdown();
    }

    /// Idempotent. The socket file goes before the ownership lock, so the
    /// next owner never finds our file.
    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.listener = None;
        if let Some(owner) = self.owner.take() {
            if let Err(e) = self.endpoint.unregister(&owner) {
                debug!(endpoint = %self.endpoint, error = %e, "endpoint cleanup failed");
            }
        }
    }
}

impl Drop for PrimaryHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: Listener, bridge: EventBridge, read_timeout: Duration) {
    loop {
        let mut conn = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let bridge = bridge.clone();
        tokio::spawn(async move {
            match channel::receive(&mut conn, read_timeout).await {
                Ok(msg) if msg.trim().is_empty() => debug!("empty forwarded message ignored"),
                Ok(msg) => {
                    info!(path = %msg, "received forwarded path");
                    bridge.post(AppEvent::PathForwarded(msg));
                }
                Err(e) => debug!(error = %e, "dropping forwarded message"),
            }
        });
    }
}
