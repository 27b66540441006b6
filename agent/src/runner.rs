//! Executes one `run_test` command: preflight, model resolution, container
//! lifecycle, log shipping, and the final status report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use kitt::engines;
use kitt::types::ModelFormat;
use stream_event::{CpuArch, LogLine, ReportedStatus, RunTestPayload, StatusUpdate};

use crate::client::ControllerClient;
use crate::error::AgentError;
use crate::runtime::{ContainerRuntime, RunSpec};

const LOG_FLUSH_EVERY: Duration = Duration::from_secs(1);
const LOG_BATCH_MAX: usize = 50;

#[derive(Clone)]
pub struct RunnerEnv {
    pub arch: CpuArch,
    pub storage_dir: PathBuf,
    pub share_mount: Option<PathBuf>,
    /// Host directory the container writes metrics into.
    pub results_dir: PathBuf,
}

/// Runs the benchmark to completion and reports the terminal status. All
/// failures are reported as `failed` with a structured error; this function
/// only errors when even that report fails.
pub async fn run_test(
    client: Arc<ControllerClient>,
    runtime: Arc<dyn ContainerRuntime>,
    env: RunnerEnv,
    payload: RunTestPayload,
) -> Result<Option<String>, AgentError> {
    match execute(&client, runtime, &env, &payload).await {
        Ok(metrics) => {
            client
                .post_status(
                    &payload.test_id,
                    &StatusUpdate {
                        status: ReportedStatus::Completed,
                        error: None,
                        metrics_json: Some(metrics),
                    },
                )
                .await?;
            Ok(None)
        }
        Err(e) => {
            tracing::warn!(test = %payload.test_id, error = %e, "benchmark failed");
            client
                .post_status(
                    &payload.test_id,
                    &StatusUpdate {
                        status: ReportedStatus::Failed,
                        error: Some(e.to_string()),
                        metrics_json: None,
                    },
                )
                .await?;
            Ok(Some(e.to_string()))
        }
    }
}

async fn execute(
    client: &Arc<ControllerClient>,
    runtime: Arc<dyn ContainerRuntime>,
    env: &RunnerEnv,
    payload: &RunTestPayload,
) -> Result<serde_json::Value, AgentError> {
    // Fail closed before any container work.
    let engine = engines::lookup(&payload.engine)
        .ok_or_else(|| AgentError::Runtime(format!("unknown engine {}", payload.engine)))?;
    if !engine.supports_arch(env.arch) {
        return Err(AgentError::Runtime(format!(
            "unsupported_arch: {} has no {} image",
            engine.name,
            env.arch.as_str()
        )));
    }
    if let Some(format) = ModelFormat::infer(&payload.model) {
        if !engine.supports_format(format) {
            return Err(AgentError::Runtime(format!(
                "unsupported_format: {} does not load {format} models",
                engine.name
            )));
        }
    }

    let resolved =
        crate::models::resolve(&env.storage_dir, env.share_mount.as_deref(), &payload.model)
            .await?;
    let platform = engine.platform(env.arch);
    runtime.pull(engine.image, &platform).await?;

    tokio::fs::create_dir_all(&env.results_dir).await?;
    let metrics_name = format!("{}.json", payload.test_id);
    let mut spec = RunSpec {
        image: engine.image.to_string(),
        platform,
        name: format!("kitt-{}", payload.test_id),
        env: vec![
            ("KITT_TEST_ID".into(), payload.test_id.clone()),
            ("KITT_SUITE".into(), payload.suite.clone()),
            ("KITT_ENGINE_PORT".into(), engine.default_port.to_string()),
            ("KITT_HEALTH_PATH".into(), engine.health_path.to_string()),
            ("KITT_RESULTS_FILE".into(), format!("/results/{metrics_name}")),
        ],
        mounts: vec![(env.results_dir.clone(), "/results".into())],
        gpu: true,
        host_network: true,
        args: Vec::new(),
    };
    match &resolved {
        Some(path) => {
            spec.mounts.push((path.clone(), "/model".into()));
            spec.env.push(("KITT_MODEL".into(), "/model".into()));
        }
        None => {
            // Not cached anywhere local; the engine fetches it itself.
            spec.env.push(("KITT_MODEL".into(), payload.model.clone()));
        }
    }

    let container_id = runtime.run(&spec).await?;
    client
        .post_status(
            &payload.test_id,
            &StatusUpdate {
                status: ReportedStatus::Running,
                error: None,
                metrics_json: None,
            },
        )
        .await?;

    ship_logs(client, Arc::clone(&runtime), &container_id, &payload.test_id).await?;
    let exit = runtime.wait(&container_id).await?;
    if exit != 0 {
        return Err(AgentError::Runtime(format!(
            "benchmark container exited with code {exit}"
        )));
    }

    let metrics_path = env.results_dir.join(&metrics_name);
    let raw = tokio::fs::read_to_string(&metrics_path)
        .await
        .map_err(|e| AgentError::Runtime(format!("no metrics at {metrics_path:?}: {e}")))?;
    Ok(serde_json::from_str(&raw)?)
}

/// Tails container output into the controller in small batches until the
/// stream closes.
async fn ship_logs(
    client: &Arc<ControllerClient>,
    runtime: Arc<dyn ContainerRuntime>,
    container_id: &str,
    test_id: &str,
) -> Result<(), AgentError> {
    let mut stream = runtime.logs(container_id).await?;
    let mut batch: Vec<LogLine> = Vec::new();
    let mut flush = tokio::time::interval(LOG_FLUSH_EVERY);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            line = stream.recv() => match line {
                Some(line) => {
                    batch.push(LogLine {
                        ts: Utc::now().to_rfc3339(),
                        line,
                    });
                    if batch.len() >= LOG_BATCH_MAX {
                        push(client, test_id, &mut batch).await;
                    }
                }
                None => break,
            },
            _ = flush.tick() => {
                if !batch.is_empty() {
                    push(client, test_id, &mut batch).await;
                }
            }
        }
    }
    if !batch.is_empty() {
        push(client, test_id, &mut batch).await;
    }
    Ok(())
}

async fn push(client: &Arc<ControllerClient>, test_id: &str, batch: &mut Vec<LogLine>) {
    let lines = std::mem::take(batch);
    if let Err(e) = client.push_logs(test_id, &lines).await {
        // Log delivery is best effort; the run itself continues.
        tracing::warn!(test = test_id, error = %e, dropped = lines.len(), "log push failed");
    }
}
