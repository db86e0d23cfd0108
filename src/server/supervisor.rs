use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifacts::catalog::ArtifactRef;
use crate::artifacts::store::ArtifactStore;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::events::{EventBus, ServerStateChanged};
use crate::server::backend::{launch_spec, Backend, LaunchSpec};
use crate::server::port::allocate_port;
use crate::server::registry::{ServerInstance, ServerRegistry, ServerState};

/// Environment variable carrying the shutdown bearer token to the child.
const SHUTDOWN_TOKEN_ENV: &str = "CAMTRAP_SHUTDOWN_TOKEN";

/// Request timeout (seconds) passed to the server's own `--timeout` flag.
const SERVER_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Grace period between asking the process group to terminate and killing it.
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Spawns inference server processes, drives their readiness protocol and
/// owns graceful/forced teardown.
///
/// State machine per instance: `Starting → Healthy → Stopping → Stopped`,
/// with `Failed` reachable from `Starting` (spawn error, early exit,
/// readiness timeout) or from `Healthy` (unexpected process death). There is
/// no automatic restart; a `Failed` entry stays in the registry for the
/// caller to notice.
pub struct ProcessSupervisor {
    config: RuntimeConfig,
    registry: Arc<ServerRegistry>,
    events: EventBus,
    client: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(config: RuntimeConfig, registry: Arc<ServerRegistry>, events: EventBus) -> Self {
        Self {
            config,
            registry,
            events,
            client: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Start an inference server for an installed model/runtime pair.
    ///
    /// Returns once the server answered its first successful health check
    /// (state `Healthy`), or with state `Stopped` if [`stop`](Self::stop) was
    /// called while the instance was still starting; cancellation preempts
    /// the readiness timeout and is not an error.
    pub async fn start(
        &self,
        model: &ArtifactRef,
        runtime: &ArtifactRef,
        store: &ArtifactStore,
    ) -> Result<ServerInstance, RuntimeError> {
        let backend = Backend::for_model_id(&model.id)?;

        if !store.is_installed(runtime) {
            return Err(RuntimeError::ProcessSpawnFailure(format!(
                "runtime {runtime} is not installed"
            )));
        }
        if !store.is_installed(model) {
            return Err(RuntimeError::ProcessSpawnFailure(format!(
                "model {model} is not installed"
            )));
        }

        let port = allocate_port(&self.registry, self.config.port_policy)?;
        let spec = launch_spec(
            backend,
            &store.install_dir(runtime),
            &store.install_dir(model),
            port,
            SERVER_REQUEST_TIMEOUT_SECS,
        );
        self.start_with_spec(spec, model.clone(), runtime.clone(), port)
            .await
    }

    /// Lower-level start for an already-resolved launch command. Used by
    /// [`start`](Self::start) and by tests that substitute their own server
    /// process.
    pub async fn start_with_spec(
        &self,
        spec: LaunchSpec,
        model: ArtifactRef,
        runtime: ArtifactRef,
        port: u16,
    ) -> Result<ServerInstance, RuntimeError> {
        if !self.config.allow_multiple_instances
            && self.registry.has_live_instance(&model, &runtime)
        {
            return Err(RuntimeError::InstanceAlreadyRunning(model.to_string()));
        }

        let shutdown_token = Uuid::new_v4().to_string();

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .env(SHUTDOWN_TOKEN_ENV, &shutdown_token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group so the whole tree (litserve forks workers) can be
        // signalled at once.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| RuntimeError::ProcessSpawnFailure(format!("{:?}: {e}", spec.program)))?;
        let pid = child
            .id()
            .ok_or_else(|| RuntimeError::ProcessSpawnFailure("child has no pid".into()))?;

        info!(
            "Spawned {} server (pid {}) on port {}",
            model.id, pid, port
        );

        let cancel = CancellationToken::new();
        let instance = ServerInstance {
            pid,
            port,
            model: model.clone(),
            runtime,
            state: ServerState::Starting,
            started_at: Instant::now(),
            shutdown_token,
        };
        self.registry.register(instance, cancel.clone());
        self.emit_state(pid, port, &model, ServerState::Starting);

        self.pipe_logs(&mut child, &model.id, pid);
        self.watch_exit(child, pid, port, model.clone());

        self.readiness_loop(pid, port, &model, &cancel).await
    }

    /// Forward child stdout/stderr lines into the host log.
    fn pipe_logs(&self, child: &mut tokio::process::Child, model_id: &str, pid: u32) {
        if let Some(stdout) = child.stdout.take() {
            let tag = format!("{model_id} pid {pid}");
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{tag}] {line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tag = format!("{model_id} pid {pid}");
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{tag}] {line}");
                }
            });
        }
    }

    /// Reap the child and mark the instance `Failed` if it died while it was
    /// supposed to be running.
    fn watch_exit(
        &self,
        mut child: tokio::process::Child,
        pid: u32,
        port: u16,
        model: ArtifactRef,
    ) {
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let expected = matches!(
                registry.get(pid).map(|i| i.state),
                Some(ServerState::Stopping) | Some(ServerState::Stopped) | None
            );
            if expected {
                debug!("Server pid {} exited after stop ({:?})", pid, status);
                return;
            }
            warn!("Server pid {} exited unexpectedly ({:?})", pid, status);
            registry.set_state(pid, ServerState::Failed);
            events.emit_server(ServerStateChanged {
                pid,
                port,
                model,
                state: ServerState::Failed,
            });
        });
    }

    /// Poll `GET /health` until it succeeds, the budget runs out, the process
    /// dies, or the instance is stopped. Suspends between polls so other work
    /// interleaves during the startup window.
    async fn readiness_loop(
        &self,
        pid: u32,
        port: u16,
        model: &ArtifactRef,
        cancel: &CancellationToken,
    ) -> Result<ServerInstance, RuntimeError> {
        let url = format!("http://127.0.0.1:{port}/health");

        for attempt in 1..=self.config.health_retries {
            // A stop request during startup preempts the timeout budget. The
            // stop call owns termination and bookkeeping; the instance ends
            // up `Stopped`, not timed out.
            if cancel.is_cancelled() {
                info!("Startup of pid {} cancelled by stop request", pid);
                let mut instance = self.snapshot(pid, port, model);
                instance.state = ServerState::Stopped;
                return Ok(instance);
            }

            // The exit watcher flags early death; no point polling a corpse.
            if matches!(self.registry.get(pid).map(|i| i.state), Some(ServerState::Failed)) {
                kill_process_tree(pid).await;
                return Err(RuntimeError::ProcessSpawnFailure(format!(
                    "server process {pid} exited during startup"
                )));
            }

            let poll = self
                .client
                .get(&url)
                .timeout(self.config.health_request_timeout)
                .send()
                .await;
            match poll {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        "Server pid {} healthy on port {} after {} poll(s)",
                        pid, port, attempt
                    );
                    self.registry.set_state(pid, ServerState::Healthy);
                    self.emit_state(pid, port, model, ServerState::Healthy);
                    return Ok(self.snapshot(pid, port, model));
                }
                // Connection refused and non-2xx are both expected while the
                // server is still loading weights; count and keep polling.
                Ok(resp) => debug!("Health poll {}: {}", attempt, resp.status()),
                Err(e) => debug!("Health poll {}: {}", attempt, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.health_interval) => {}
            }
        }

        // A stop may have landed during the last inter-poll sleep; it wakes
        // the select and ends the loop, but it must still win over the
        // timeout. The stop call owns termination and bookkeeping.
        if cancel.is_cancelled() {
            info!("Startup of pid {} cancelled by stop request", pid);
            let mut instance = self.snapshot(pid, port, model);
            instance.state = ServerState::Stopped;
            return Ok(instance);
        }

        // Budget exhausted: the instance must not stay `Starting` forever and
        // the OS process must not be left behind.
        warn!(
            "Server pid {} never became healthy, terminating",
            pid
        );
        kill_process_tree(pid).await;
        self.registry.set_state(pid, ServerState::Failed);
        self.emit_state(pid, port, model, ServerState::Failed);
        Err(RuntimeError::HealthCheckTimeout {
            attempts: self.config.health_retries,
        })
    }

    /// Stop a server instance: graceful HTTP shutdown first, then a
    /// process-tree kill, then `Stopped` and unregister. Idempotent: unknown
    /// pids and already-dead processes are treated as success.
    pub async fn stop(&self, pid: u32) -> Result<(), RuntimeError> {
        let instance = match self.registry.get(pid) {
            Some(i) => i,
            None => {
                debug!("stop({}): not registered, nothing to do", pid);
                return Ok(());
            }
        };

        // Preempt a readiness loop still in flight.
        if let Some(cancel) = self.registry.cancel_token(pid) {
            cancel.cancel();
        }

        self.registry.set_state(pid, ServerState::Stopping);
        self.emit_state(pid, instance.port, &instance.model, ServerState::Stopping);

        // Phase 1: authenticated graceful shutdown, lets in-flight inference
        // requests drain. Failure here is logged, never fatal.
        let url = format!("http://127.0.0.1:{}/shutdown", instance.port);
        let graceful = self
            .client
            .post(&url)
            .bearer_auth(&instance.shutdown_token)
            .timeout(self.config.health_request_timeout)
            .send()
            .await;
        match graceful {
            Ok(resp) if resp.status().is_success() => {
                debug!("Graceful shutdown accepted by pid {}", pid)
            }
            Ok(resp) => warn!(
                "{}",
                RuntimeError::ShutdownFailure(format!(
                    "pid {pid} answered {} to shutdown",
                    resp.status()
                ))
            ),
            Err(e) => warn!(
                "{}",
                RuntimeError::ShutdownFailure(format!("pid {pid}: {e}"))
            ),
        }

        // Phase 2: kill the whole tree regardless; some backends fork worker
        // processes that must not survive.
        kill_process_tree(pid).await;

        self.registry.set_state(pid, ServerState::Stopped);
        self.emit_state(pid, instance.port, &instance.model, ServerState::Stopped);
        self.registry.unregister(pid);
        info!("Server pid {} stopped", pid);
        Ok(())
    }

    /// Stop every registered instance. Used at host shutdown.
    pub async fn stop_all(&self) {
        for instance in self.registry.list() {
            if let Err(e) = self.stop(instance.pid).await {
                warn!("Failed to stop pid {}: {}", instance.pid, e);
            }
        }
    }

    fn emit_state(&self, pid: u32, port: u16, model: &ArtifactRef, state: ServerState) {
        self.events.emit_server(ServerStateChanged {
            pid,
            port,
            model: model.clone(),
            state,
        });
    }

    fn snapshot(&self, pid: u32, port: u16, model: &ArtifactRef) -> ServerInstance {
        self.registry.get(pid).unwrap_or_else(|| {
            // Already unregistered (a stop completed under us).
            ServerInstance {
                pid,
                port,
                model: model.clone(),
                runtime: ArtifactRef::runtime("", ""),
                state: ServerState::Stopped,
                started_at: Instant::now(),
                shutdown_token: String::new(),
            }
        })
    }
}

/// Terminate a spawned server process together with any workers it forked.
/// Safe to call on a process that already exited.
pub async fn kill_process_tree(pid: u32) {
    #[cfg(unix)]
    {
        // The child was spawned as its own process group leader, so the
        // negative pid addresses the whole group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        tokio::time::sleep(TERM_GRACE).await;
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(windows)]
    {
        let _ = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .await;
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
    }
}

/// Whether a pid is still alive. Test and diagnostics helper.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}
