use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use trailcam_classifier::config::{IpcConfig, IpcTransport, JobDefaults};
use trailcam_classifier::engine::{Engine, EngineCallbacks};
use trailcam_classifier::ipc::{try_become_primary, Arbitration, Endpoint, Handshake, PrimaryHandle};
use trailcam_classifier::model::{AppEvent, JobConfig};
use trailcam_classifier::orchestrator::{channel, EventReceiver, JobRunner, Session};

fn handshake() -> Handshake {
    Handshake {
        connect_timeout: Duration::from_millis(500),
        write_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_secs(1),
    }
}

#[cfg(unix)]
fn unix_endpoint(dir: &Path, name: &str) -> Endpoint {
    let ipc = IpcConfig {
        transport: IpcTransport::Unix,
        socket_dir: dir.to_path_buf(),
        ..Default::default()
    };
    Endpoint::resolve(name, &ipc).unwrap()
}

async fn primary(endpoint: &Endpoint, arg: Option<&str>) -> PrimaryHandle {
    match try_become_primary(endpoint, arg, handshake()).await {
        Arbitration::Primary(h) => h,
        other => panic!("expected primary, got {}", other.role()),
    }
}

async fn next_event(rx: &mut EventReceiver) -> AppEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event within 5s")
        .expect("bridge closed")
}

async fn quiet_for(rx: &mut EventReceiver, d: Duration) -> bool {
    tokio::time::timeout(d, rx.recv()).await.is_err()
}

struct NoOp;

#[async_trait(?Send)]
impl Engine for NoOp {
    async fn classify(&self, _config: &JobConfig, _cb: &dyn EngineCallbacks) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
#[tokio::test]
async fn secondary_hands_its_folder_to_the_primary() {
    let sockets = tempfile::tempdir().unwrap();
    let photos = tempfile::tempdir().unwrap();
    let photos_arg = photos.path().display().to_string();
    let endpoint = unix_endpoint(sockets.path(), "TrailcamClassifierApp");

    // A: launched without an argument.
    let mut a = primary(&endpoint, None).await;
    let (bridge, mut rx) = channel();
    let runner = JobRunner::new(Arc::new(NoOp), bridge.clone());
    let defaults = JobDefaults {
        output: sockets.path().join("out"),
        model: sockets.path().join("model.pt"),
        confidence_threshold: 0.65,
    };
    let mut session = Session::new(runner, defaults);
    a.serve(bridge, handshake().read_timeout);

    // B: launched with the folder; it must not become a second primary.
    let b = try_become_primary(&endpoint, Some(&photos_arg), handshake()).await;
    assert!(matches!(b, Arbitration::Secondary));

    let forwarded = next_event(&mut rx).await;
    assert_eq!(forwarded, AppEvent::PathForwarded(photos_arg.clone()));
    session.apply(forwarded);

    match next_event(&mut rx).await {
        AppEvent::JobStarted { dirs, .. } => assert_eq!(dirs, vec![photos.path().to_path_buf()]),
        other => panic!("expected JobStarted, got {other:?}"),
    }
    a.close();
}

/// Launch `n` arbitrations at once, each on its own task.
#[cfg(unix)]
async fn launch_together(endpoint: &Endpoint, n: usize) -> Vec<(String, Arbitration)> {
    let tasks: Vec<_> = (0..n)
        .map(|i| {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let arg = format!("/data/launch-{i}");
                let role = try_become_primary(&endpoint, Some(&arg), handshake()).await;
                (arg, role)
            })
        })
        .collect();
    let mut out = Vec::new();
    for t in tasks {
        out.push(t.await.unwrap());
    }
    out
}

/// Exactly one launch must win; every other one must have handed its
/// argument to the winner.
#[cfg(unix)]
async fn assert_single_primary(results: Vec<(String, Arbitration)>) -> PrimaryHandle {
    let mut winner = None;
    let mut forwarded = Vec::new();
    for (arg, role) in results {
        match role {
            Arbitration::Primary(h) => {
                assert!(winner.is_none(), "two primaries elected");
                winner = Some(h);
            }
            Arbitration::Secondary => forwarded.push(arg),
            Arbitration::Standalone => panic!("{arg} fell back to standalone"),
        }
    }
    let mut handle = winner.expect("no primary elected");

    let (bridge, mut rx) = channel();
    handle.serve(bridge, handshake().read_timeout);
    let mut received = Vec::new();
    for _ in 0..forwarded.len() {
        match next_event(&mut rx).await {
            AppEvent::PathForwarded(p) => received.push(p),
            other => panic!("unexpected event {other:?}"),
        }
    }
    forwarded.sort();
    received.sort();
    assert_eq!(received, forwarded);
    assert!(quiet_for(&mut rx, Duration::from_millis(100)).await);
    handle
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_launches_elect_one_primary() {
    for round in 0..20 {
        let sockets = tempfile::tempdir().unwrap();
        let endpoint = unix_endpoint(sockets.path(), &format!("RaceTest{round}"));
        let results = launch_together(&endpoint, 3).await;
        assert_single_primary(results).await.close();
    }
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_launches_over_a_stale_socket_elect_one_primary() {
    for round in 0..20 {
        let sockets = tempfile::tempdir().unwrap();
        let endpoint = unix_endpoint(sockets.path(), &format!("StaleRace{round}"));
        let Endpoint::Unix(path) = &endpoint else {
            panic!("expected a unix endpoint");
        };
        drop(std::os::unix::net::UnixListener::bind(path).unwrap());

        let results = launch_together(&endpoint, 3).await;
        let handle = assert_single_primary(results).await;

        // The winner is the one reachable primary.
        let late = try_become_primary(&endpoint, None, handshake()).await;
        assert!(matches!(late, Arbitration::Secondary), "got {}", late.role());
        handle.close();
    }
}

#[cfg(unix)]
#[tokio::test]
async fn live_primary_keeps_ownership_when_its_socket_file_vanishes() {
    let sockets = tempfile::tempdir().unwrap();
    let endpoint = unix_endpoint(sockets.path(), "VanishedSocket");
    let Endpoint::Unix(path) = &endpoint else {
        panic!("expected a unix endpoint");
    };

    let first = primary(&endpoint, None).await;
    std::fs::remove_file(path).unwrap();

    // Unreachable, but still owned: no second primary.
    let second = try_become_primary(&endpoint, Some("/data/x"), handshake()).await;
    assert!(matches!(second, Arbitration::Standalone), "got {}", second.role());

    first.close();
    let third = primary(&endpoint, None).await;
    let fourth = try_become_primary(&endpoint, Some("/data/y"), handshake()).await;
    assert!(matches!(fourth, Arbitration::Secondary), "got {}", fourth.role());
    third.close();
}

#[cfg(unix)]
#[tokio::test]
async fn stale_socket_is_reclaimed() {
    let sockets = tempfile::tempdir().unwrap();
    let endpoint = unix_endpoint(sockets.path(), "StaleTest");
    let Endpoint::Unix(path) = &endpoint else {
        panic!("expected a unix endpoint");
    };

    // A crashed primary leaves its socket file behind.
    drop(std::os::unix::net::UnixListener::bind(path).unwrap());
    assert!(path.exists());

    let handle = primary(&endpoint, Some("/data/photos")).await;
    handle.close();
    assert!(!path.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn secondary_without_argument_sends_nothing() {
    let sockets = tempfile::tempdir().unwrap();
    let endpoint = unix_endpoint(sockets.path(), "NoArgTest");

    let mut a = primary(&endpoint, None).await;
    let (bridge, mut rx) = channel();
    a.serve(bridge, Duration::from_millis(200));

    let b = try_become_primary(&endpoint, None, handshake()).await;
    assert!(matches!(b, Arbitration::Secondary));
    assert!(quiet_for(&mut rx, Duration::from_millis(500)).await);
    a.close();
}

#[cfg(unix)]
#[tokio::test]
async fn closed_primary_lets_the_next_launch_take_over() {
    let sockets = tempfile::tempdir().unwrap();
    let endpoint = unix_endpoint(sockets.path(), "HandoverTest");

    let first = primary(&endpoint, None).await;
    first.close();

    let second = primary(&endpoint, None).await;
    drop(second);
}

#[tokio::test]
async fn loopback_tcp_transport_forwards() {
    let name = format!("trailcam-tcp-test-{}", std::process::id());
    let endpoint = Endpoint::tcp_for(&name);

    let mut a = primary(&endpoint, None).await;
    let (bridge, mut rx) = channel();
    a.serve(bridge, handshake().read_timeout);

    let b = try_become_primary(&endpoint, Some("/data/photos"), handshake()).await;
    assert!(matches!(b, Arbitration::Secondary));
    assert_eq!(
        next_event(&mut rx).await,
        AppEvent::PathForwarded("/data/photos".into())
    );
    a.close();
}
