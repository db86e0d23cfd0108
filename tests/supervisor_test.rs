//! Supervisor integration tests. The server process is substituted with a
//! long-running `sleep`, and the health endpoint with a local stub, so the
//! readiness and teardown machinery is exercised without any ML stack.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use camtrap_runtime::server::supervisor::process_alive;
use camtrap_runtime::{
    ArtifactRef, EventBus, LaunchSpec, ProcessSupervisor, RuntimeConfig, RuntimeError,
    ServerRegistry, ServerState,
};

fn fast_config(dir: &TempDir, retries: u32) -> RuntimeConfig {
    RuntimeConfig {
        health_retries: retries,
        health_interval: Duration::from_millis(50),
        health_request_timeout: Duration::from_millis(250),
        ..RuntimeConfig::new(dir.path())
    }
}

fn sleep_spec() -> LaunchSpec {
    LaunchSpec {
        program: PathBuf::from("sleep"),
        args: vec!["60".into()],
        cwd: std::env::temp_dir(),
    }
}

fn refs() -> (ArtifactRef, ArtifactRef) {
    (
        ArtifactRef::model("manas", "1.0"),
        ArtifactRef::runtime("python-common", "2025.1"),
    )
}

/// Minimal HTTP responder standing in for the server's health (and shutdown)
/// endpoints. Returns the port it listens on.
async fn spawn_health_responder() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    port
}

/// An unbound port, for exercising the connection-refused path.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn start_reaches_healthy_and_stop_tears_down() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ServerRegistry::new());
    let supervisor =
        ProcessSupervisor::new(fast_config(&dir, 30), Arc::clone(&registry), EventBus::default());
    let (model, runtime) = refs();
    let port = spawn_health_responder().await;

    let instance = supervisor
        .start_with_spec(sleep_spec(), model, runtime, port)
        .await
        .unwrap();
    assert_eq!(instance.state, ServerState::Healthy);
    assert_eq!(instance.port, port);
    assert!(process_alive(instance.pid));
    assert_eq!(registry.get(instance.pid).unwrap().state, ServerState::Healthy);

    supervisor.stop(instance.pid).await.unwrap();
    assert!(registry.get(instance.pid).is_none());
    assert!(
        !process_alive(instance.pid),
        "stop must not leave the spawned process behind"
    );
}

#[tokio::test]
async fn readiness_timeout_kills_the_process() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ServerRegistry::new());
    let config = fast_config(&dir, 3);
    let budget = config.health_retries as u128
        * (config.health_interval + config.health_request_timeout).as_millis();
    let supervisor = ProcessSupervisor::new(config, Arc::clone(&registry), EventBus::default());
    let (model, runtime) = refs();
    let port = dead_port().await;

    let started = Instant::now();
    let err = supervisor
        .start_with_spec(sleep_spec(), model, runtime, port)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::HealthCheckTimeout { attempts: 3 }));
    // Bounded by retries x (interval + request timeout), plus the kill grace
    // and scheduling slack.
    assert!(started.elapsed() < Duration::from_millis(budget as u64 + 2000));

    let failed: Vec<_> = registry.list();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].state, ServerState::Failed);
    assert!(
        !process_alive(failed[0].pid),
        "timeout must not leave the spawned process behind"
    );
}

#[tokio::test]
async fn stop_while_starting_preempts_the_timeout() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ServerRegistry::new());
    let supervisor = Arc::new(ProcessSupervisor::new(
        fast_config(&dir, 100),
        Arc::clone(&registry),
        EventBus::default(),
    ));
    let (model, runtime) = refs();
    let port = dead_port().await;

    let start_task = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            supervisor
                .start_with_spec(sleep_spec(), model, runtime, port)
                .await
        })
    };

    // Wait for the instance to appear in the registry, then stop it while it
    // is still Starting.
    let pid = loop {
        if let Some(instance) = registry.list().first() {
            break instance.pid;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    supervisor.stop(pid).await.unwrap();

    let result = start_task.await.unwrap();
    let instance = result.expect("a preempted start is not an error");
    assert_eq!(instance.state, ServerState::Stopped);
    assert!(registry.get(pid).is_none());
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn stop_during_the_last_poll_interval_still_wins() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ServerRegistry::new());
    // A single retry: the stop lands while the one inter-poll sleep is
    // running, so the readiness budget is exhausted the moment it wakes.
    let config = RuntimeConfig {
        health_retries: 1,
        health_interval: Duration::from_secs(2),
        health_request_timeout: Duration::from_millis(250),
        ..RuntimeConfig::new(dir.path())
    };
    let supervisor = Arc::new(ProcessSupervisor::new(
        config,
        Arc::clone(&registry),
        EventBus::default(),
    ));
    let (model, runtime) = refs();
    let port = dead_port().await;

    let start_task = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            supervisor
                .start_with_spec(sleep_spec(), model, runtime, port)
                .await
        })
    };

    let pid = loop {
        if let Some(instance) = registry.list().first() {
            break instance.pid;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    // The failed poll against the unbound port is near-instant, so by now
    // the loop is inside its only sleep.
    tokio::time::sleep(Duration::from_millis(100)).await;
    supervisor.stop(pid).await.unwrap();

    let instance = start_task
        .await
        .unwrap()
        .expect("a stopped start must not report a readiness timeout");
    assert_eq!(instance.state, ServerState::Stopped);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn early_process_death_fails_the_start() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ServerRegistry::new());
    let supervisor =
        ProcessSupervisor::new(fast_config(&dir, 50), Arc::clone(&registry), EventBus::default());
    let (model, runtime) = refs();
    let port = dead_port().await;

    let spec = LaunchSpec {
        program: PathBuf::from("true"),
        args: vec![],
        cwd: std::env::temp_dir(),
    };
    let err = supervisor
        .start_with_spec(spec, model, runtime, port)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ProcessSpawnFailure(_)));
}

#[tokio::test]
async fn spawn_failure_surfaces_immediately() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ServerRegistry::new());
    let supervisor =
        ProcessSupervisor::new(fast_config(&dir, 3), Arc::clone(&registry), EventBus::default());
    let (model, runtime) = refs();

    let spec = LaunchSpec {
        program: PathBuf::from("/nonexistent/interpreter"),
        args: vec![],
        cwd: std::env::temp_dir(),
    };
    let err = supervisor
        .start_with_spec(spec, model, runtime, 9999)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ProcessSpawnFailure(_)));
    assert!(registry.list().is_empty());
}

#[tokio::test]
async fn strict_mode_rejects_a_second_instance() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ServerRegistry::new());
    let config = RuntimeConfig {
        allow_multiple_instances: false,
        ..fast_config(&dir, 30)
    };
    let supervisor = ProcessSupervisor::new(config, Arc::clone(&registry), EventBus::default());
    let (model, runtime) = refs();
    let port = spawn_health_responder().await;

    let first = supervisor
        .start_with_spec(sleep_spec(), model.clone(), runtime.clone(), port)
        .await
        .unwrap();

    let err = supervisor
        .start_with_spec(sleep_spec(), model, runtime, port + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InstanceAlreadyRunning(_)));

    supervisor.stop(first.pid).await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ServerRegistry::new());
    let supervisor =
        ProcessSupervisor::new(fast_config(&dir, 30), Arc::clone(&registry), EventBus::default());
    let (model, runtime) = refs();
    let port = spawn_health_responder().await;

    let instance = supervisor
        .start_with_spec(sleep_spec(), model, runtime, port)
        .await
        .unwrap();
    supervisor.stop(instance.pid).await.unwrap();
    // Second stop on an already-dead, unregistered instance.
    supervisor.stop(instance.pid).await.unwrap();
}
