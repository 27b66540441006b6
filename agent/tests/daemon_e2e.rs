//! Full loop against a live controller: register, heartbeat-pull, run a
//! scripted container, ship logs, report metrics.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use agent::config::AgentConfig;
use agent::daemon::Daemon;
use agent::runtime::mock::MockRuntime;
use kitt::store::sqlite::SqliteStore;
use kitt::store::Store;
use kitt::{Controller, Tuning};
use serve::{run_serve_on_listener, ServeConfig};

const ADMIN_TOKEN: &str = "daemon-e2e-admin";

async fn start_controller() -> (String, Arc<Controller>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(dir.path().join("kitt.db")).unwrap());
    store.migrate().unwrap();
    let ctrl = Controller::new(store, Tuning::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let serve_ctrl = Arc::clone(&ctrl);
    tokio::spawn(async move {
        let _ = run_serve_on_listener(
            listener,
            serve_ctrl,
            ServeConfig {
                admin_token: ADMIN_TOKEN.to_string(),
                public_url: None,
                agent_package: None,
            },
        )
        .await;
    });
    (base, ctrl, dir)
}

#[tokio::test(flavor = "multi_thread")]
async fn daemon_runs_a_dispatched_test_end_to_end() {
    std::env::set_var("KITT_AUTH_TOKEN", ADMIN_TOKEN);
    let (base, ctrl, _server_dir) = start_controller().await;

    let home = tempfile::tempdir().unwrap();
    let mut cfg = AgentConfig::new(&base);
    cfg.name = Some("e2e-agent".into());
    let runtime = Arc::new(MockRuntime::new(
        vec![
            "engine starting".to_string(),
            "model loaded".to_string(),
            "benchmark done".to_string(),
        ],
        0,
    ));
    let daemon = Arc::new(
        Daemon::new(
            home.path().to_path_buf(),
            cfg,
            Arc::clone(&runtime) as Arc<dyn agent::runtime::ContainerRuntime>,
        )
        .unwrap(),
    );
    daemon.register_once().await.unwrap();

    // Identity was persisted for the next start.
    let saved = AgentConfig::load(home.path()).unwrap();
    assert!(saved.agent_id.is_some());
    assert!(saved.token.is_some());

    // Operator dispatches a quick test to this agent.
    let http = reqwest::Client::new();
    let test: Value = http
        .post(format!("{base}/api/v1/quicktest"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({
            "agent": "e2e-agent",
            "engine": "llama_cpp",
            "model": "llama-7b-q4_k_m.gguf",
            "suite": "smoke"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let test_id = test["id"].as_str().unwrap().to_string();

    // The "benchmark container" leaves its metrics where the runner looks.
    let results_dir = home.path().join("results");
    std::fs::create_dir_all(&results_dir).unwrap();
    std::fs::write(
        results_dir.join(format!("{test_id}.json")),
        r#"{"throughput_tps": 101.5, "total": 5, "passed": 5, "failed": 0, "duration_seconds": 12.0}"#,
    )
    .unwrap();

    // One heartbeat pulls and starts the command.
    daemon.beat_once().await.unwrap();

    // The runner task drives the test to completed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let done = loop {
        let t = ctrl.store.get_quick_test(&test_id).unwrap().unwrap();
        if t.status.is_terminal() {
            break t;
        }
        assert!(tokio::time::Instant::now() < deadline, "test never finished");
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_eq!(done.status, kitt::TestStatus::Completed);
    assert_eq!(done.error, None);

    // Metrics blob round-tripped into a run.
    let run = ctrl
        .store
        .get_run(done.result_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    let blob: Value = serde_json::from_str(&run.raw_json).unwrap();
    assert_eq!(blob["throughput_tps"], 101.5);
    assert_eq!(run.passed, 5);

    // Image pull matched the host platform, and logs were shipped verbatim.
    let pulled = runtime.pulled.lock().unwrap().clone();
    assert_eq!(pulled.len(), 1);
    assert!(pulled[0].starts_with("ghcr.io/ggml-org/llama.cpp:server@linux/"));
    let logs = ctrl.store.quick_test_logs(&test_id).unwrap();
    let lines: Vec<&str> = logs.iter().map(|l| l.line.as_str()).collect();
    assert_eq!(
        lines,
        vec!["engine starting", "model loaded", "benchmark done"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn daemon_reports_failure_when_container_fails() {
    std::env::set_var("KITT_AUTH_TOKEN", ADMIN_TOKEN);
    let (base, ctrl, _server_dir) = start_controller().await;

    let home = tempfile::tempdir().unwrap();
    let mut cfg = AgentConfig::new(&base);
    cfg.name = Some("e2e-agent-fail".into());
    let runtime = Arc::new(MockRuntime::new(vec!["oom".to_string()], 137));
    let daemon = Arc::new(
        Daemon::new(
            home.path().to_path_buf(),
            cfg,
            Arc::clone(&runtime) as Arc<dyn agent::runtime::ContainerRuntime>,
        )
        .unwrap(),
    );
    daemon.register_once().await.unwrap();

    let http = reqwest::Client::new();
    let test: Value = http
        .post(format!("{base}/api/v1/quicktest"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({
            "agent": "e2e-agent-fail",
            "engine": "llama_cpp",
            "model": "llama-70b-q8_0.gguf",
            "suite": "smoke"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let test_id = test["id"].as_str().unwrap().to_string();

    daemon.beat_once().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let done = loop {
        let t = ctrl.store.get_quick_test(&test_id).unwrap().unwrap();
        if t.status.is_terminal() {
            break t;
        }
        assert!(tokio::time::Instant::now() < deadline, "test never finished");
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_eq!(done.status, kitt::TestStatus::Failed);
    assert!(done.error.unwrap().contains("exited with code 137"));
}
