//! Engine process lifecycle.
//!
//! One `std::sync::Mutex` guards all process tracking; the termination
//! watcher runs on an arbitrary worker thread, so an async lock would not
//! help and the critical sections are all short. Every background loop
//! carries the generation it was started under and checks it before writing,
//! so a callback from a previous process can never clobber a newer state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::schema::EngineConfig;
use crate::error::{KeepError, Result};
use crate::events::{emit, Event, EventSender};
use crate::server::control::ControlPlaneClient;
use crate::server::launch;
use crate::server::{EngineFault, EngineState, ModelStatus};

#[derive(Debug)]
struct Shared {
    state: EngineState,
    /// Bumped on every start and stop. Background loops compare before
    /// writing anything.
    generation: u64,
    pid: Option<u32>,
    /// Flipped to true by the termination watcher once the child exits.
    exit_rx: Option<watch::Receiver<bool>>,
    statuses: HashMap<String, ModelStatus>,
    /// The model most recently asked for via `load_model`.
    requested_active: Option<String>,
    resident_bytes: u64,
}

/// Point-in-time view of the engine for status displays.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub pid: Option<u32>,
    pub active_model: Option<String>,
    pub models: HashMap<String, ModelStatus>,
    pub resident_bytes: u64,
}

pub struct ProcessSupervisor {
    shared: Arc<Mutex<Shared>>,
    config: EngineConfig,
    control: ControlPlaneClient,
    events: EventSender,
    catalog: Catalog,
    models_dir: PathBuf,
    host_mb: u64,
    launch_config_path: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(
        config: EngineConfig,
        catalog: Catalog,
        models_dir: PathBuf,
        host_mb: u64,
        events: EventSender,
    ) -> Result<Self> {
        let control = ControlPlaneClient::new(config.port)?;
        let launch_config_path = models_dir.join("engine-launch.json");
        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                state: EngineState::Idle,
                generation: 0,
                pid: None,
                exit_rx: None,
                statuses: HashMap::new(),
                requested_active: None,
                resident_bytes: 0,
            })),
            config,
            control,
            events,
            catalog,
            models_dir,
            host_mb,
            launch_config_path,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the engine. No-op when already loading or running; from `Idle`
    /// or `Errored` it regenerates the launch config and starts fresh.
    /// Readiness is established asynchronously; watch the event channel for
    /// the Loading→Running (or Errored) transition.
    pub async fn start(&self) -> Result<()> {
        let generation = {
            let mut s = self.lock();
            if matches!(s.state, EngineState::Loading | EngineState::Running) {
                return Ok(());
            }
            s.generation += 1;
            s.state = EngineState::Loading;
            s.statuses.clear();
            s.resident_bytes = 0;
            s.generation
        };
        emit(&self.events, Event::EngineStateChanged(EngineState::Loading));

        match self.spawn_engine(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut s = self.lock();
                if s.generation == generation {
                    s.state = EngineState::Idle;
                    s.pid = None;
                    drop(s);
                    emit(&self.events, Event::EngineStateChanged(EngineState::Idle));
                }
                Err(e)
            }
        }
    }

    async fn spawn_engine(&self, generation: u64) -> Result<()> {
        let binary = launch::resolve_binary(&self.config)?;
        let launch_config =
            launch::build_launch_config(&self.catalog, &self.models_dir, self.host_mb);
        launch::write_launch_config(&launch_config, &self.launch_config_path)?;

        let mut command = launch::build_command(&binary, &self.config, &self.launch_config_path);
        let mut child = command
            .spawn()
            .map_err(|e| KeepError::Launch(format!("cannot spawn {}: {e}", binary.display())))?;

        let pid = child.id();
        info!(
            "engine started (pid {:?}, {} model(s) in launch config)",
            pid,
            launch_config.models.len()
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_engine_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_engine_output(stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        // A stop() may have slipped in while we were spawning; it owns
        // the state now, so reap the child instead of tracking it. The
        // guard must leave scope before any await for the future to be Send.
        let superseded = {
            let mut s = self.lock();
            if s.generation != generation {
                true
            } else {
                s.pid = pid;
                s.exit_rx = Some(exit_rx);
                false
            }
        };
        if superseded {
            info!("engine superseded before tracking, reaping it");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Ok(());
        }

        // The watcher owns the child; everyone else signals by pid and
        // observes exit through the watch channel.
        tokio::spawn(termination_watcher(
            child,
            exit_tx,
            Arc::clone(&self.shared),
            self.events.clone(),
            generation,
        ));

        tokio::spawn(readiness_loop(
            Arc::clone(&self.shared),
            self.control.clone(),
            self.config.clone(),
            self.events.clone(),
            generation,
        ));
        Ok(())
    }

    /// Stop the engine. Tracking is cleared and `Idle` published before the
    /// signal goes out, so no exit callback can race us into `Errored`.
    pub async fn stop(&self) -> Result<()> {
        let (pid, exit_rx, was_running) = {
            let mut s = self.lock();
            s.generation += 1;
            let was_running = s.state != EngineState::Idle;
            s.state = EngineState::Idle;
            s.statuses.clear();
            s.requested_active = None;
            s.resident_bytes = 0;
            (s.pid.take(), s.exit_rx.take(), was_running)
        };
        if was_running {
            emit(&self.events, Event::EngineStateChanged(EngineState::Idle));
        }
        let Some(pid) = pid else { return Ok(()) };

        info!("stopping engine (pid {pid})");
        // The process may already be gone; both signals are best-effort.
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

        if let Some(mut rx) = exit_rx {
            let grace = Duration::from_millis(self.config.stop_grace_ms);
            let already_exited = *rx.borrow_and_update();
            if !already_exited && tokio::time::timeout(grace, rx.changed()).await.is_err() {
                warn!("engine ignored SIGTERM, escalating to SIGKILL");
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                // SIGKILL cannot be ignored; block until the watcher reaps
                // the exit.
                while !*rx.borrow_and_update() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop-then-start. No-op when idle.
    pub async fn reload(&self) -> Result<()> {
        if self.state() == EngineState::Idle {
            return Ok(());
        }
        self.stop().await?;
        self.start().await
    }

    /// Request a model load. Starts the engine when needed, records the
    /// request immediately, and issues the control-plane call from a
    /// background task once the engine is ready.
    pub async fn load_model(&self, model_id: &str) -> Result<()> {
        if matches!(self.state(), EngineState::Idle | EngineState::Errored(_)) {
            self.start().await?;
        }
        let generation = {
            let mut s = self.lock();
            s.requested_active = Some(model_id.to_string());
            s.statuses
                .insert(model_id.to_string(), ModelStatus::Loading);
            s.generation
        };

        let shared = Arc::clone(&self.shared);
        let control = self.control.clone();
        let config = self.config.clone();
        let model = model_id.to_string();
        tokio::spawn(async move {
            if !wait_for_running(&shared, &config, generation).await {
                return;
            }
            if let Err(e) = control.load(&model).await {
                warn!("load of {model} failed: {e}");
                let mut s = shared.lock().unwrap_or_else(|e| e.into_inner());
                if s.generation == generation {
                    s.statuses.insert(model, ModelStatus::Unloaded);
                }
            }
            // The status loop picks up the loaded/loading transitions.
        });
        Ok(())
    }

    /// Request a model unload. No-op when the engine is not running.
    pub async fn unload_model(&self, model_id: &str) -> Result<()> {
        {
            let mut s = self.lock();
            if s.state != EngineState::Running {
                return Ok(());
            }
            if s.requested_active.as_deref() == Some(model_id) {
                s.requested_active = None;
            }
        }
        let control = self.control.clone();
        let model = model_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = control.unload(&model).await {
                warn!("unload of {model} failed: {e}");
            }
        });
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.lock().state.clone()
    }

    #[must_use]
    pub fn active_model(&self) -> Option<String> {
        self.lock().requested_active.clone()
    }

    /// Last status the engine reported for a model, if any.
    #[must_use]
    pub fn model_status(&self, model_id: &str) -> Option<ModelStatus> {
        self.lock().statuses.get(model_id).copied()
    }

    /// Whether a variant is the requested-active model or reported loaded.
    #[must_use]
    pub fn model_is_active(&self, model_id: &str) -> bool {
        let s = self.lock();
        s.requested_active.as_deref() == Some(model_id)
            || matches!(
                s.statuses.get(model_id),
                Some(ModelStatus::Loaded | ModelStatus::Loading)
            )
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        let s = self.lock();
        EngineSnapshot {
            state: s.state.clone(),
            pid: s.pid,
            active_model: s.requested_active.clone(),
            models: s.statuses.clone(),
            resident_bytes: s.resident_bytes,
        }
    }
}

/// Forward engine stdout/stderr lines into the log stream.
async fn forward_engine_output<R>(reader: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "engine", "{line}");
    }
}

/// Owns the child and reports its exit. A clean exit settles to `Idle`, any
/// other to `Errored(Crashed)`, but only when the state is still ours: an
/// explicit `stop()` has already moved to `Idle` and bumped the generation.
async fn termination_watcher(
    mut child: tokio::process::Child,
    exit_tx: watch::Sender<bool>,
    shared: Arc<Mutex<Shared>>,
    events: EventSender,
    generation: u64,
) {
    let status = child.wait().await;
    let code = status.ok().and_then(|st| st.code());
    let _ = exit_tx.send(true);

    let mut s = shared.lock().unwrap_or_else(|e| e.into_inner());
    if s.generation != generation || s.state == EngineState::Idle {
        return;
    }
    let next = if code == Some(0) {
        EngineState::Idle
    } else {
        warn!("engine exited unexpectedly (code {code:?})");
        EngineState::Errored(EngineFault::Crashed(code))
    };
    s.state = next.clone();
    s.pid = None;
    s.statuses.clear();
    s.requested_active = None;
    s.resident_bytes = 0;
    drop(s);
    emit(&events, Event::EngineStateChanged(next));
}

/// Poll `/health` until the engine answers or the attempt budget runs out.
async fn readiness_loop(
    shared: Arc<Mutex<Shared>>,
    control: ControlPlaneClient,
    config: EngineConfig,
    events: EventSender,
    generation: u64,
) {
    let interval = Duration::from_millis(config.health_poll_interval_ms);
    for attempt in 0..config.health_poll_attempts {
        if control.health().await {
            let pid = {
                let mut s = shared.lock().unwrap_or_else(|e| e.into_inner());
                if s.generation != generation || s.state != EngineState::Loading {
                    return;
                }
                s.state = EngineState::Running;
                s.pid
            };
            info!("engine ready after {} attempt(s)", attempt + 1);
            emit(&events, Event::EngineStateChanged(EngineState::Running));

            tokio::spawn(status_loop(
                Arc::clone(&shared),
                control.clone(),
                config.clone(),
                generation,
            ));
            if let Some(pid) = pid {
                tokio::spawn(memory_loop(
                    Arc::clone(&shared),
                    events,
                    config,
                    generation,
                    pid,
                ));
            }
            return;
        }
        {
            let s = shared.lock().unwrap_or_else(|e| e.into_inner());
            if s.generation != generation || s.state != EngineState::Loading {
                return;
            }
        }
        tokio::time::sleep(interval).await;
    }

    let pid = {
        let mut s = shared.lock().unwrap_or_else(|e| e.into_inner());
        if s.generation != generation || s.state != EngineState::Loading {
            return;
        }
        s.state = EngineState::Errored(EngineFault::HealthCheckFailed);
        // The health fault is the resting state: invalidate the termination
        // watcher so the kill below does not get reported as a crash.
        s.generation += 1;
        s.statuses.clear();
        s.requested_active = None;
        s.exit_rx = None;
        s.pid.take()
    };
    warn!("engine never became healthy, giving up");
    emit(
        &events,
        Event::EngineStateChanged(EngineState::Errored(EngineFault::HealthCheckFailed)),
    );
    if let Some(pid) = pid {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

/// Refresh per-model statuses while running; with an idle-sleep timer
/// configured, reconcile engine-side eviction of the active model.
async fn status_loop(
    shared: Arc<Mutex<Shared>>,
    control: ControlPlaneClient,
    config: EngineConfig,
    generation: u64,
) {
    let interval = Duration::from_millis(config.status_poll_interval_ms);
    loop {
        tokio::time::sleep(interval).await;
        {
            let s = shared.lock().unwrap_or_else(|e| e.into_inner());
            if s.generation != generation || s.state != EngineState::Running {
                return;
            }
        }

        let statuses = match control.models().await {
            Ok(map) => map,
            Err(e) => {
                // Transient; the termination watcher owns crash detection.
                debug!("status poll failed: {e}");
                continue;
            }
        };

        let active = {
            let mut s = shared.lock().unwrap_or_else(|e| e.into_inner());
            if s.generation != generation || s.state != EngineState::Running {
                return;
            }
            s.statuses = statuses.clone();
            s.requested_active.clone()
        };

        if config.idle_sleep_secs.is_none() {
            continue;
        }
        let Some(model) = active else { continue };
        if statuses.get(&model) != Some(&ModelStatus::Loaded) {
            continue;
        }
        if control.is_sleeping(&model).await.unwrap_or(false) {
            info!("{model} went to sleep, releasing it");
            let _ = control.unload(&model).await;
            let mut s = shared.lock().unwrap_or_else(|e| e.into_inner());
            if s.generation == generation {
                s.requested_active = None;
                s.statuses.insert(model, ModelStatus::Unloaded);
            }
        }
    }
}

/// Sample the child's resident memory while running.
async fn memory_loop(
    shared: Arc<Mutex<Shared>>,
    events: EventSender,
    config: EngineConfig,
    generation: u64,
    pid: u32,
) {
    let interval = Duration::from_millis(config.memory_poll_interval_ms);
    let sys_pid = sysinfo::Pid::from_u32(pid);
    let mut sys = sysinfo::System::new();
    let mut last = 0u64;
    loop {
        tokio::time::sleep(interval).await;
        {
            let s = shared.lock().unwrap_or_else(|e| e.into_inner());
            if s.generation != generation || s.state != EngineState::Running {
                return;
            }
        }
        if !sys.refresh_process(sys_pid) {
            return;
        }
        let Some(process) = sys.process(sys_pid) else { return };
        let resident = process.memory();
        if resident != last {
            last = resident;
            {
                let mut s = shared.lock().unwrap_or_else(|e| e.into_inner());
                if s.generation != generation {
                    return;
                }
                s.resident_bytes = resident;
            }
            emit(
                &events,
                Event::EngineMemoryChanged {
                    resident_bytes: resident,
                },
            );
        }
    }
}

/// Wait until the engine reaches `Running` under the given generation.
/// Bounded by the readiness window; false means it never got there.
async fn wait_for_running(
    shared: &Arc<Mutex<Shared>>,
    config: &EngineConfig,
    generation: u64,
) -> bool {
    let deadline = u64::from(config.health_poll_attempts)
        .saturating_mul(config.health_poll_interval_ms)
        + 1000;
    let step = Duration::from_millis(100);
    let mut waited = 0u64;
    loop {
        {
            let s = shared.lock().unwrap_or_else(|e| e.into_inner());
            if s.generation != generation {
                return false;
            }
            match s.state {
                EngineState::Running => return true,
                EngineState::Loading => {}
                _ => return false,
            }
        }
        if waited >= deadline {
            return false;
        }
        tokio::time::sleep(step).await;
        waited += 100;
    }
}
