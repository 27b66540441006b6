//! End-to-end HTTP tests against a controller bound to an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use kitt::store::sqlite::SqliteStore;
use kitt::store::Store;
use kitt::{Controller, Tuning};
use serve::{run_serve_on_listener, ServeConfig};

const ADMIN_TOKEN: &str = "test-admin-token";

struct TestServer {
    base: String,
    ctrl: Arc<Controller>,
    _dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server() -> TestServer {
    start_server_with(Tuning {
        campaign_poll: Duration::from_millis(10),
        simulate_step_ms: (1, 3),
        ..Default::default()
    })
    .await
}

async fn start_server_with(tuning: Tuning) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(dir.path().join("kitt.db")).unwrap());
    store.migrate().unwrap();
    let ctrl = Controller::new(store, tuning);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let serve_ctrl = Arc::clone(&ctrl);
    let handle = tokio::spawn(async move {
        let config = ServeConfig {
            admin_token: ADMIN_TOKEN.to_string(),
            public_url: None,
            agent_package: None,
        };
        let _ = run_serve_on_listener(listener, serve_ctrl, config).await;
    });
    // The accept loop is up once the listener is bound; no wait needed.
    TestServer {
        base,
        ctrl,
        _dir: dir,
        handle,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn register_body(name: &str, arch: &str) -> Value {
    json!({
        "name": name,
        "host": "10.0.0.5",
        "port": 9101,
        "cpu_arch": arch,
        "hardware": {
            "gpu": "RTX 4090",
            "cpu": "EPYC",
            "ram_gb": 64.0,
            "compute_capability": "8.9",
            "environment_type": "baremetal",
            "vram_gb": 24.0
        },
        "kitt_version": "0.2.0"
    })
}

async fn register(server: &TestServer, name: &str, arch: &str) -> (String, String) {
    let resp = client()
        .post(format!("{}/api/v1/agents/register", server.base))
        .bearer_auth(ADMIN_TOKEN)
        .json(&register_body(name, arch))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    (
        body["agent_id"].as_str().unwrap().to_string(),
        body["token"].as_str().unwrap().to_string(),
    )
}

fn heartbeat_body() -> Value {
    json!({
        "status": "online",
        "gpu_util": 0.0,
        "gpu_mem_gb": 0.0,
        "storage_free_gb": 500.0,
        "uptime_s": 10
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn token_provisioning_and_recovery() {
    let server = start_server().await;
    let (agent_id, token) = register(&server, "nodeA", "arm64").await;
    assert!(!token.is_empty());

    // Heartbeat with the issued token works.
    let resp = client()
        .post(format!("{}/api/v1/agents/{agent_id}/heartbeat", server.base))
        .bearer_auth(&token)
        .json(&heartbeat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // A stale agent id (controller reset on the agent's view) gets 404.
    let resp = client()
        .post(format!("{}/api/v1/agents/ghost-id/heartbeat", server.base))
        .bearer_auth(&token)
        .json(&heartbeat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Re-register with the same name: row is found and healed, token kept.
    let resp = client()
        .post(format!("{}/api/v1/agents/register", server.base))
        .bearer_auth(ADMIN_TOKEN)
        .json(&register_body("nodeA", "arm64"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["agent_id"].as_str().unwrap(), agent_id);
    assert!(body.get("token").is_none() || body["token"].as_str() == Some(""));

    // The original token still authenticates.
    let resp = client()
        .post(format!("{}/api/v1/agents/{agent_id}/heartbeat", server.base))
        .bearer_auth(&token)
        .json(&heartbeat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Exactly one row.
    let agents: Value = client()
        .get(format!("{}/api/v1/agents", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agents["agents"].as_array().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn preflight_rejects_before_queueing() {
    let server = start_server().await;
    let (agent_id, _token) = register(&server, "nodeA", "arm64").await;

    let resp = client()
        .post(format!("{}/api/v1/quicktest", server.base))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({
            "agent": "nodeA",
            "engine": "tgi",
            "model": "/m/llama-7b.safetensors",
            "suite": "smoke"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"].as_str().unwrap(), "unsupported_arch");

    // No command reached the agent queue.
    let pending = server.ctrl.agents.pending_commands(&agent_id).unwrap();
    assert!(pending.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn quicktest_happy_path_with_sse_log_order() {
    let server = start_server().await;
    let (agent_id, token) = register(&server, "nodeA", "amd64").await;

    let test: Value = client()
        .post(format!("{}/api/v1/quicktest", server.base))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({
            "agent": "nodeA",
            "engine": "llama_cpp",
            "model": "/m/llama-7b-q4_k_m.gguf",
            "suite": "smoke"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let test_id = test["id"].as_str().unwrap().to_string();
    assert_eq!(test["status"].as_str().unwrap(), "queued");

    // Open the SSE stream for this test before any logs arrive.
    let sse = client()
        .get(format!(
            "{}/api/v1/events/stream/quicktest:{test_id}",
            server.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(
        sse.headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "text/event-stream"
    );

    // Agent heartbeat pulls the run_test command; the row turns dispatched.
    let hb: Value = client()
        .post(format!("{}/api/v1/agents/{agent_id}/heartbeat", server.base))
        .bearer_auth(&token)
        .json(&heartbeat_body())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let commands = hb["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["kind"].as_str().unwrap(), "run_test");

    // Agent pushes three log lines, then running, then completed + metrics.
    let resp = client()
        .post(format!("{}/api/v1/quicktest/{test_id}/logs", server.base))
        .bearer_auth(&token)
        .json(&json!([
            {"ts": "2026-08-01T00:00:00Z", "line": "loading"},
            {"ts": "2026-08-01T00:00:01Z", "line": "ready"},
            {"ts": "2026-08-01T00:00:02Z", "line": "t=100s tok/s=125"}
        ]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    for update in [
        json!({"status": "running"}),
        json!({"status": "completed", "metrics_json": {"throughput_tps": 125.0}}),
    ] {
        let resp = client()
            .post(format!("{}/api/v1/quicktest/{test_id}/status", server.base))
            .bearer_auth(&token)
            .json(&update)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    // Final row: completed, linked to a run carrying the metrics.
    let done: Value = client()
        .get(format!("{}/api/v1/quicktest/{test_id}", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(done["status"].as_str().unwrap(), "completed");
    let run_id = done["result_id"].as_str().unwrap();

    let exported = client()
        .get(format!("{}/api/v1/runs/{run_id}/export", server.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let exported: Value = serde_json::from_str(&exported).unwrap();
    assert_eq!(exported, json!({"throughput_tps": 125.0}));

    // SSE delivered the three log events in publication order.
    let mut sse = sse;
    let mut buffer = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while buffer.matches("event: log").count() < 3 {
        let chunk = tokio::time::timeout_at(deadline, sse.chunk())
            .await
            .expect("sse stalled")
            .unwrap()
            .expect("sse closed early");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
    let log_lines: Vec<&str> = buffer
        .lines()
        .filter(|l| l.starts_with("data: ") && l.contains("\"type\":\"log\""))
        .collect();
    let positions: Vec<usize> = ["loading", "ready", "t=100s tok/s=125"]
        .iter()
        .map(|needle| {
            log_lines
                .iter()
                .position(|l| l.contains(needle))
                .unwrap_or_else(|| panic!("missing log {needle:?} in {log_lines:?}"))
        })
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn write_endpoints_require_bearer_or_csrf() {
    let server = start_server().await;

    // No credentials at all.
    let resp = client()
        .post(format!("{}/api/v1/campaigns", server.base))
        .json(&json!({"config_yaml": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Wrong bearer.
    let resp = client()
        .post(format!("{}/api/v1/campaigns", server.base))
        .bearer_auth("wrong")
        .json(&json!({"config_yaml": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Bad CSRF is forbidden, not unauthorized.
    let resp = client()
        .post(format!("{}/api/v1/campaigns", server.base))
        .header("x-csrf-token", "made-up")
        .json(&json!({"config_yaml": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // A browser session with an issued CSRF token may mutate (the YAML is
    // still validated, hence 400 rather than an auth failure).
    let csrf: Value = client()
        .get(format!("{}/api/v1/csrf", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let resp = client()
        .post(format!("{}/api/v1/campaigns", server.base))
        .header("x-csrf-token", csrf["csrf_token"].as_str().unwrap())
        .json(&json!({"config_yaml": "not: [valid campaign"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_results_store_is_gone() {
    let server = start_server().await;
    let resp = client()
        .get(format!("{}/api/v1/store/karr", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 410);
}

#[tokio::test(flavor = "multi_thread")]
async fn campaign_over_http_on_test_agent() {
    let server = start_server().await;

    let agent: Value = client()
        .post(format!("{}/api/v1/agents/test", server.base))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({"name": "virtual-a"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let agent_id = agent["id"].as_str().unwrap();

    let yaml = r#"
campaign_name: http-smoke
models:
  - name: tiny-1b-q4_k_m
    gguf_repo: org/tiny-1b-gguf
engines:
  - name: llama_cpp
    suite: smoke
"#;
    let campaign: Value = client()
        .post(format!("{}/api/v1/campaigns", server.base))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({"config_yaml": yaml, "agent": agent_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = campaign["id"].as_str().unwrap().to_string();
    assert_eq!(campaign["status"].as_str().unwrap(), "draft");

    let resp = client()
        .post(format!("{}/api/v1/campaigns/{id}/launch", server.base))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let done = loop {
        let current: Value = client()
            .get(format!("{}/api/v1/campaigns/{id}", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = current["status"].as_str().unwrap().to_string();
        if ["completed", "failed", "cancelled"].contains(&status.as_str()) {
            break current;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "campaign stuck in {status}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(done["status"].as_str().unwrap(), "completed");
    assert_eq!(done["counters"]["total_runs"], 1);
    assert_eq!(done["counters"]["succeeded"], 1);

    let logs: Value = client()
        .get(format!("{}/api/v1/campaigns/{id}/logs", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let lines: Vec<String> = logs["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["line"].as_str().unwrap().to_string())
        .collect();
    assert!(lines
        .iter()
        .any(|l| l.starts_with("starting: tiny-1b-q4_k_m/llama_cpp/smoke")));
}
