//! Rendezvous endpoint: where the primary instance listens.
//!
//! A unix domain socket on unix, or a loopback TCP port derived from the
//! instance name. The arbitration protocol only needs `try_connect`,
//! `try_bind` and `unregister` from this layer.

use crate::config::{IpcConfig, IpcTransport};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// First port of the dynamic/private range (RFC 6335).
const DYNAMIC_PORT_BASE: u16 = 49152;
const DYNAMIC_PORT_SPAN: u16 = 16384;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A connected peer, whatever the transport.
pub type Connection = Box<dyn AsyncStream>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Resolve the endpoint for `name` under the configured transport.
    pub fn resolve(name: &str, ipc: &IpcConfig) -> Result<Self> {
        let name = sanitize_name(name);
        match ipc.transport {
            IpcTransport::Tcp => Ok(Self::tcp_for(&name)),
            #[cfg(unix)]
            IpcTransport::Unix | IpcTransport::Auto => {
                let dir = socket_dir(ipc);
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("create socket dir: {}", dir.display()))?;
                Ok(Self::Unix(dir.join(format!("{name}.sock"))))
            }
            #[cfg(not(unix))]
            IpcTransport::Unix => {
                anyhow::bail!("unix transport is not available on this platform")
            }
            #[cfg(not(unix))]
            IpcTransport::Auto => Ok(Self::tcp_for(&name)),
        }
    }

    pub fn tcp_for(name: &str) -> Self {
        Self::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, derive_port(name))))
    }

    /// Connect within `timeout`. Refused, missing and slow endpoints all fail.
    pub async fn try_connect(&self, timeout: Duration) -> io::Result<Connection> {
        let connect = async {
            match self {
                #[cfg(unix)]
                Self::Unix(path) => {
                    let s = UnixStream::connect(path).await?;
                    Ok::<Connection, io::Error>(Box::new(s))
                }
                Self::Tcp(addr) => {
                    let s = TcpStream::connect(addr).await?;
                    Ok::<Connection, io::Error>(Box::new(s))
                }
            }
        };
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
    }

    /// Claim the endpoint and listen. Fails with `AddrInUse` while another
    /// instance owns it.
    ///
    /// For unix sockets, ownership is an advisory lock on a sibling
    /// `.lock` file, held for as long as the returned [`OwnerLock`] lives.
    /// The kernel drops it when a primary dies, so a socket file found
    /// while holding the lock is stale and is removed before binding.
    pub fn try_bind(&self) -> io::Result<(Listener, Option<OwnerLock>)> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => {
                let lock = OwnerLock::acquire(path)?;
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                let listener = UnixListener::bind(path)?;
                Ok((Listener::Unix(listener), Some(lock)))
            }
            Self::Tcp(addr) => {
                let std_listener = std::net::TcpListener::bind(addr)?;
                std_listener.set_nonblocking(true)?;
                let listener = TcpListener::from_std(std_listener)?;
                Ok((Listener::Tcp(listener), None))
            }
        }
    }

    /// Remove the socket file. Only the holder of the [`OwnerLock`] may
    /// call this; TCP ports vanish with their listener.
    pub fn unregister(&self, _owner: &OwnerLock) -> io::Result<bool> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => match std::fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            },
            Self::Tcp(_) => Ok(false),
        }
    }
}

/// Exclusive ownership of a unix socket endpoint.
pub struct OwnerLock {
    #[cfg(unix)]
    _file: std::fs::File,
}

impl OwnerLock {
    #[cfg(unix)]
    fn acquire(socket: &Path) -> io::Result<Self> {
        let mut lock_path = socket.as_os_str().to_owned();
        lock_path.push(".lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        match file.try_lock() {
            Ok(()) => Ok(Self { _file: file }),
            Err(std::fs::TryLockError::WouldBlock) => Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "endpoint is owned by another instance",
            )),
            Err(std::fs::TryLockError::Error(e)) => Err(e),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

pub enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            #[cfg(unix)]
            Self::Unix(l) => {
                let (s, _) = l.accept().await?;
                Ok(Box::new(s))
            }
            Self::Tcp(l) => {
                let (s, peer) = l.accept().await?;
                // Only loopback peers may hand us work.
                if !peer.ip().is_loopback() {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("rejected non-loopback peer {peer}"),
                    ));
                }
                Ok(Box::new(s))
            }
        }
    }
}

/// Deterministic port in the dynamic range for an instance name.
pub fn derive_port(name: &str) -> u16 {
    let digest = Sha256::digest(name.as_bytes());
    let n = u16::from_be_bytes([digest[0], digest[1]]);
    DYNAMIC_PORT_BASE + (n % DYNAMIC_PORT_SPAN)
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "trailcam-classifier".into()
    } else {
        cleaned
    }
}

#[cfg(unix)]
fn socket_dir(ipc: &IpcConfig) -> PathBuf {
    if !ipc.socket_dir.as_os_str().is_empty() {
        return ipc.socket_dir.clone();
    }
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_port_is_stable_and_in_dynamic_range() {
        let a = derive_port("TrailcamClassifierApp");
        assert_eq!(a, derive_port("TrailcamClassifierApp"));
        assert!(a >= DYNAMIC_PORT_BASE);
        assert_ne!(a, derive_port("SomeOtherApp"));
    }

    #[test]
    fn names_are_made_path_safe() {
        assert_eq!(sanitize_name("Trail cam/App"), "Trail_cam_App");
        assert_eq!(sanitize_name(""), "trailcam-classifier");
    }

    #[cfg(unix)]
    #[test]
    fn unix_endpoint_lives_in_socket_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ipc = IpcConfig {
            transport: IpcTransport::Unix,
            socket_dir: dir.path().to_path_buf(),
            ..IpcConfig::default()
        };
        let ep = Endpoint::resolve("TrailcamClassifierApp", &ipc).unwrap();
        assert_eq!(
            ep,
            Endpoint::Unix(dir.path().join("TrailcamClassifierApp.sock"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_bind_reports_addr_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoint::Unix(dir.path().join("x.sock"));
        let _first = ep.try_bind().unwrap();
        let err = ep.try_bind().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_to_missing_socket_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoint::Unix(dir.path().join("nobody.sock"));
        assert!(ep.try_connect(Duration::from_millis(200)).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn socket_file_without_an_owner_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.sock");
        let ep = Endpoint::Unix(path.clone());
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let (_listener, owner) = ep.try_bind().unwrap();
        assert!(ep.try_connect(Duration::from_millis(200)).await.is_ok());
        assert!(ep.unregister(&owner.unwrap()).unwrap());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn owner_keeps_the_endpoint_even_if_its_socket_file_vanishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.sock");
        let ep = Endpoint::Unix(path.clone());

        let first = ep.try_bind().unwrap();
        std::fs::remove_file(&path).unwrap();
        let err = ep.try_bind().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        drop(first);
        assert!(ep.try_bind().is_ok());
    }
}
