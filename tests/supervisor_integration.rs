//! Supervisor lifecycle tests against a fake engine binary (a shell script)
//! and a stub control-plane server.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use llamakeep::catalog::Catalog;
use llamakeep::config::schema::EngineConfig;
use llamakeep::events::{self, Event, EventReceiver};
use llamakeep::server::{EngineFault, EngineState, ModelStatus, ProcessSupervisor};

const HOST_MB: u64 = 1_000_000;

/// Write an executable script that plays the engine process.
fn fake_engine(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-llama-server");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn engine_config(binary: PathBuf, port: u16) -> EngineConfig {
    EngineConfig {
        binary: Some(binary),
        port,
        health_poll_interval_ms: 50,
        health_poll_attempts: 5,
        status_poll_interval_ms: 50,
        memory_poll_interval_ms: 50,
        stop_grace_ms: 300,
        ..EngineConfig::default()
    }
}

fn empty_catalog() -> Catalog {
    Catalog::from_json(r#"{"families":[]}"#).unwrap()
}

fn supervisor(
    config: EngineConfig,
    models_dir: &Path,
    events: events::EventSender,
) -> ProcessSupervisor {
    ProcessSupervisor::new(
        config,
        empty_catalog(),
        models_dir.to_path_buf(),
        HOST_MB,
        events,
    )
    .unwrap()
}

type RequestLog = Arc<Mutex<Vec<String>>>;

/// Stub control plane: /health, /models, /props, /models/{load,unload}.
async fn control_stub(
    listener: TcpListener,
    models_body: String,
    sleeping: bool,
    log: RequestLog,
) {
    loop {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        let models_body = models_body.clone();
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            // The client pools connections, so keep serving until it hangs up.
            loop {
                let mut buf = vec![0u8; 8192];
                let n = match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let req = String::from_utf8_lossy(&buf[..n]).to_string();
                let line = req.lines().next().unwrap_or("").to_string();
                log.lock().unwrap().push(line.clone());

                let body = if line.starts_with("GET /health") {
                    r#"{"status":"ok"}"#.to_string()
                } else if line.starts_with("GET /models") {
                    models_body.clone()
                } else if line.starts_with("GET /props") {
                    format!(r#"{{"default_generation_settings":{{"is_sleeping":{sleeping}}}}}"#)
                } else {
                    "{}".to_string()
                };
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
                    body.len()
                );
                if sock.write_all(head.as_bytes()).await.is_err()
                    || sock.write_all(body.as_bytes()).await.is_err()
                {
                    return;
                }
            }
        });
    }
}

async fn spawn_control_stub(models_body: &str, sleeping: bool) -> (u16, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(control_stub(
        listener,
        models_body.to_string(),
        sleeping,
        Arc::clone(&log),
    ));
    (port, log)
}

/// Port with nothing listening: bind and immediately drop.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_state(rx: &mut EventReceiver, wanted: &EngineState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {wanted}"))
            .expect("event channel closed");
        if let Event::EngineStateChanged(state) = event {
            if &state == wanted {
                return;
            }
        }
    }
}

#[tokio::test]
async fn test_start_reaches_running_and_stop_returns_idle() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let (port, _log) = spawn_control_stub(r#"{"data":[]}"#, false).await;

    let (events, mut rx) = events::channel();
    let sup = supervisor(engine_config(binary, port), dir.path(), events);

    sup.start().await.unwrap();
    wait_for_state(&mut rx, &EngineState::Running).await;
    assert!(sup.snapshot().pid.is_some());

    sup.stop().await.unwrap();
    assert_eq!(sup.state(), EngineState::Idle);
    assert_eq!(sup.snapshot().pid, None);
}

#[tokio::test]
async fn test_start_is_idempotent_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let (port, _log) = spawn_control_stub(r#"{"data":[]}"#, false).await;

    let (events, mut rx) = events::channel();
    let sup = supervisor(engine_config(binary, port), dir.path(), events);

    sup.start().await.unwrap();
    wait_for_state(&mut rx, &EngineState::Running).await;
    let pid = sup.snapshot().pid;

    sup.start().await.unwrap();
    assert_eq!(sup.snapshot().pid, pid, "second start spawned a new process");
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_binary_fails_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let config = engine_config(dir.path().join("does-not-exist"), dead_port().await);

    let (events, _rx) = events::channel();
    let sup = supervisor(config, dir.path(), events);

    assert!(sup.start().await.is_err());
    assert_eq!(sup.state(), EngineState::Idle);
    assert_eq!(sup.snapshot().pid, None);
}

#[tokio::test]
async fn test_readiness_exhaustion_errors() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let config = engine_config(binary, dead_port().await);

    let (events, mut rx) = events::channel();
    let sup = supervisor(config, dir.path(), events);

    sup.start().await.unwrap();
    wait_for_state(
        &mut rx,
        &EngineState::Errored(EngineFault::HealthCheckFailed),
    )
    .await;
    assert_eq!(sup.snapshot().pid, None);
}

#[tokio::test]
async fn test_stop_before_ready_is_never_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let config = engine_config(binary, dead_port().await);

    let (events, _rx) = events::channel();
    let sup = supervisor(config, dir.path(), events);

    sup.start().await.unwrap();
    sup.stop().await.unwrap();
    assert_eq!(sup.state(), EngineState::Idle);

    // Outlive the whole readiness window; a late poll or the termination
    // watcher must not flip the state away from Idle.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(sup.state(), EngineState::Idle);
    assert_eq!(sup.snapshot().pid, None);
}

#[tokio::test]
async fn test_health_fault_is_the_resting_state() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let config = engine_config(binary, dead_port().await);

    let (events, mut rx) = events::channel();
    let sup = supervisor(config, dir.path(), events);

    sup.start().await.unwrap();
    wait_for_state(
        &mut rx,
        &EngineState::Errored(EngineFault::HealthCheckFailed),
    )
    .await;

    // The exhaustion path kills the child; the termination watcher must not
    // rewrite the health fault as a crash afterwards.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(
        sup.state(),
        EngineState::Errored(EngineFault::HealthCheckFailed)
    );
    assert_eq!(sup.snapshot().pid, None);
}

#[tokio::test]
async fn test_stop_racing_start_never_leaves_idle_with_a_pid() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let config = engine_config(binary, dead_port().await);

    let (events, _rx) = events::channel();
    let sup = Arc::new(supervisor(config, dir.path(), events));

    for _ in 0..5 {
        let starter = Arc::clone(&sup);
        let start = tokio::spawn(async move { starter.start().await });
        sup.stop().await.unwrap();
        start.await.unwrap().unwrap();

        // Whichever side won, an Idle supervisor must not track a process.
        let snap = sup.snapshot();
        if snap.state == EngineState::Idle {
            assert_eq!(snap.pid, None, "idle snapshot carries a pid");
        }
        sup.stop().await.unwrap();
        assert_eq!(sup.state(), EngineState::Idle);
        assert_eq!(sup.snapshot().pid, None);
    }

    // No late callback from any of the spawned children may resurrect state.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(sup.state(), EngineState::Idle);
    assert_eq!(sup.snapshot().pid, None);
}

#[tokio::test]
async fn test_stop_kills_and_reaps_a_sigterm_ignoring_engine() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "trap '' TERM\nsleep 60");
    let config = engine_config(binary, dead_port().await);

    let (events, _rx) = events::channel();
    let sup = supervisor(config, dir.path(), events);

    sup.start().await.unwrap();
    let pid = sup.snapshot().pid.expect("engine pid tracked after start");

    // SIGTERM is ignored by the script; stop must escalate to SIGKILL and
    // block until the exit is actually observed.
    tokio::time::timeout(Duration::from_secs(5), sup.stop())
        .await
        .expect("stop did not return after SIGKILL")
        .unwrap();

    assert_eq!(sup.state(), EngineState::Idle);
    assert_eq!(sup.snapshot().pid, None);
    // The child was reaped, so the pid no longer exists.
    assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err());
}

#[tokio::test]
async fn test_crash_is_reported_with_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "exit 3");
    let config = engine_config(binary, dead_port().await);

    let (events, mut rx) = events::channel();
    let sup = supervisor(config, dir.path(), events);

    sup.start().await.unwrap();
    wait_for_state(
        &mut rx,
        &EngineState::Errored(EngineFault::Crashed(Some(3))),
    )
    .await;
    assert_eq!(sup.snapshot().pid, None);
}

#[tokio::test]
async fn test_clean_exit_settles_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "exit 0");
    let config = engine_config(binary, dead_port().await);

    let (events, mut rx) = events::channel();
    let sup = supervisor(config, dir.path(), events);

    sup.start().await.unwrap();
    wait_for_state(&mut rx, &EngineState::Idle).await;
    assert_eq!(sup.snapshot().pid, None);
}

#[tokio::test]
async fn test_status_loop_tracks_model_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let models = r#"{"data":[{"id":"fam-7b-q4","status":{"value":"loaded"}}]}"#;
    let (port, _log) = spawn_control_stub(models, false).await;

    let (events, mut rx) = events::channel();
    let sup = supervisor(engine_config(binary, port), dir.path(), events);

    sup.start().await.unwrap();
    wait_for_state(&mut rx, &EngineState::Running).await;

    // A couple of status-poll intervals.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        sup.snapshot().models.get("fam-7b-q4"),
        Some(&ModelStatus::Loaded)
    );
    assert_eq!(sup.model_status("fam-7b-q4"), Some(ModelStatus::Loaded));
    sup.stop().await.unwrap();
    assert!(sup.snapshot().models.is_empty());
    assert_eq!(sup.model_status("fam-7b-q4"), None);
}

#[tokio::test]
async fn test_load_model_starts_engine_and_posts_load() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let models = r#"{"data":[{"id":"fam-7b-q4","status":{"value":"loaded"}}]}"#;
    let (port, log) = spawn_control_stub(models, false).await;

    let (events, mut rx) = events::channel();
    let sup = supervisor(engine_config(binary, port), dir.path(), events);

    sup.load_model("fam-7b-q4").await.unwrap();
    assert_eq!(sup.active_model().as_deref(), Some("fam-7b-q4"));
    wait_for_state(&mut rx, &EngineState::Running).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    let requests = log.lock().unwrap().clone();
    assert!(
        requests.iter().any(|r| r.starts_with("POST /models/load")),
        "no load request seen: {requests:?}"
    );
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn test_idle_sleep_reconciliation_unloads() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let models = r#"{"data":[{"id":"fam-7b-q4","status":{"value":"loaded"}}]}"#;
    // The stub reports the model asleep; the supervisor should release it.
    let (port, log) = spawn_control_stub(models, true).await;

    let mut config = engine_config(binary, port);
    config.idle_sleep_secs = Some(1);

    let (events, mut rx) = events::channel();
    let sup = supervisor(config, dir.path(), events);

    sup.load_model("fam-7b-q4").await.unwrap();
    wait_for_state(&mut rx, &EngineState::Running).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let requests = log.lock().unwrap().clone();
    assert!(
        requests.iter().any(|r| r.starts_with("POST /models/unload")),
        "no unload request seen: {requests:?}"
    );
    assert_eq!(sup.active_model(), None);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn test_launch_config_is_regenerated_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_engine(dir.path(), "sleep 60");
    let (port, _log) = spawn_control_stub(r#"{"data":[]}"#, false).await;

    let (events, mut rx) = events::channel();
    let sup = supervisor(engine_config(binary, port), dir.path(), events);

    sup.start().await.unwrap();
    wait_for_state(&mut rx, &EngineState::Running).await;

    let launch_config = dir.path().join("engine-launch.json");
    assert!(launch_config.exists());
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&launch_config).unwrap()).unwrap();
    assert!(json.get("generated_at").is_some());
    assert!(json.get("models").is_some());
    sup.stop().await.unwrap();
}
