//! Quick-test dispatcher: the queued → dispatched → running → terminal state
//! machine, the real-agent command path, the simulated test-agent path, and
//! the per-test watchdog.

pub mod preflight;
pub mod simulate;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use stream_event::{
    CommandKind, ControlEvent, LogLine, ReportedStatus, RunTestPayload, SourceId, StatusUpdate,
    StopContainerPayload, WireCommand,
};

use crate::context::Controller;
use crate::error::KittError;
use crate::store::{run_from_metrics, LogEntry, QuickTestFilter, QuickTestRecord};
use crate::types::{ModelFormat, TestStatus};

/// Error text used when the watchdog fires.
pub const TIMEOUT_ERROR: &str = "timeout";

#[derive(Clone, Debug)]
pub struct DispatchRequest {
    /// Agent id or name.
    pub agent: String,
    pub model: String,
    pub engine: String,
    pub suite: String,
    /// Bypass preflight and availability (test agents only).
    pub force: bool,
    pub campaign_id: Option<String>,
    /// Format resolved upstream (campaign cells); `None` infers from `model`.
    pub format: Option<ModelFormat>,
}

/// The only legal edges of the state machine.
pub fn transition_allowed(from: TestStatus, to: TestStatus) -> bool {
    use TestStatus::*;
    matches!(
        (from, to),
        (Queued, Dispatched)
            | (Queued, Running)
            | (Queued, Failed)
            | (Queued, Cancelled)
            | (Dispatched, Running)
            | (Dispatched, Failed)
            | (Dispatched, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

/// Dispatches one quick test. Real agents get a `run_test` command queued for
/// their next heartbeat; test agents get a simulation task. Both paths get a
/// watchdog.
pub async fn dispatch(
    ctrl: &Arc<Controller>,
    req: DispatchRequest,
) -> Result<QuickTestRecord, KittError> {
    let (record, is_test_agent) = {
        let req = req.clone();
        ctrl.run_blocking(move |ctrl| dispatch_blocking(ctrl, &req)).await?
    };
    if is_test_agent {
        simulate::spawn(Arc::clone(ctrl), record.clone());
    }
    spawn_watchdog(Arc::clone(ctrl), record.id.clone());
    Ok(record)
}

fn dispatch_blocking(
    ctrl: &Controller,
    req: &DispatchRequest,
) -> Result<(QuickTestRecord, bool), KittError> {
    let agent = match ctrl.store.get_agent(&req.agent)? {
        Some(a) => a,
        None => ctrl
            .store
            .get_agent_by_name(&req.agent)?
            .ok_or_else(|| KittError::NotFound(format!("agent {}", req.agent)))?,
    };

    let skip_checks = req.force && agent.is_test_agent;
    if !skip_checks {
        if agent.status == crate::types::AgentStatus::Offline {
            return Err(KittError::Conflict(format!(
                "agent {} is offline",
                agent.name
            )));
        }
        let active = ctrl.store.list_quick_tests(&QuickTestFilter {
            agent_id: Some(agent.id.clone()),
            active: true,
            ..Default::default()
        })?;
        if !active.is_empty() {
            return Err(KittError::Conflict(format!(
                "agent {} already has a test in flight",
                agent.name
            )));
        }
        preflight::check_dispatch(&agent, &req.engine, &req.model, req.format, None)?;
    }

    let record = QuickTestRecord {
        id: Uuid::new_v4().to_string(),
        agent_id: agent.id.clone(),
        campaign_id: req.campaign_id.clone(),
        model: req.model.clone(),
        engine: req.engine.clone(),
        suite: req.suite.clone(),
        force: req.force,
        status: TestStatus::Queued,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        result_id: None,
        error: None,
    };
    ctrl.store.insert_quick_test(&record)?;
    publish_status(ctrl, &record.id, TestStatus::Queued, None);

    if !agent.is_test_agent {
        let payload = RunTestPayload {
            test_id: record.id.clone(),
            model: record.model.clone(),
            engine: record.engine.clone(),
            suite: record.suite.clone(),
        };
        ctrl.agents.queue_command(
            &agent.id,
            WireCommand {
                id: Uuid::new_v4().to_string(),
                kind: CommandKind::RunTest,
                payload: serde_json::to_value(&payload)
                    .map_err(|e| KittError::Validation(e.to_string()))?,
            },
        )?;
    }
    tracing::info!(
        test = %record.id,
        agent = %agent.name,
        model = %record.model,
        engine = %record.engine,
        "quick test dispatched"
    );
    Ok((record, agent.is_test_agent))
}

/// Marks a queued test as handed to its agent. Called when a heartbeat
/// returns the `run_test` command.
pub fn mark_dispatched(ctrl: &Controller, test_id: &str) -> Result<(), KittError> {
    let test = get_required(ctrl, test_id)?;
    if test.status != TestStatus::Queued {
        // A later state already took over; handing out the command again is
        // harmless and must not regress the row.
        return Ok(());
    }
    ctrl.store
        .set_quick_test_status(test_id, TestStatus::Dispatched, None)?;
    publish_status(ctrl, test_id, TestStatus::Dispatched, None);
    Ok(())
}

/// Applies a status update posted by an agent (or the simulator). Rejects
/// transitions outside the state machine with `Conflict`.
pub fn record_status(
    ctrl: &Controller,
    test_id: &str,
    update: &StatusUpdate,
) -> Result<QuickTestRecord, KittError> {
    let test = get_required(ctrl, test_id)?;
    let to = match update.status {
        ReportedStatus::Running => TestStatus::Running,
        ReportedStatus::Completed => TestStatus::Completed,
        ReportedStatus::Failed => TestStatus::Failed,
    };
    if !transition_allowed(test.status, to) {
        return Err(KittError::Conflict(format!(
            "illegal transition {} -> {} for test {test_id}",
            test.status, to
        )));
    }

    if to == TestStatus::Completed {
        let metrics = update.metrics_json.as_ref().ok_or_else(|| {
            KittError::Validation("completed status requires metrics_json".into())
        })?;
        let hardware = ctrl.store.get_agent(&test.agent_id)?.map(|a| a.hardware);
        let run_id = Uuid::new_v4().to_string();
        let run = run_from_metrics(
            &run_id,
            &test.model,
            &test.engine,
            &test.suite,
            Utc::now(),
            metrics,
            hardware,
        )?;
        ctrl.store.save_run(&run)?;
        ctrl.store.link_result(test_id, &run_id)?;
        if let Err(e) = ctrl.bus.publish(
            &SourceId::QuickTest(test_id.to_string()),
            ControlEvent::RunSaved {
                run_id: run_id.clone(),
            },
        ) {
            tracing::warn!(test = test_id, error = %e, "run_saved event not published");
        }
    }

    ctrl.store
        .set_quick_test_status(test_id, to, update.error.as_deref())?;
    publish_status(ctrl, test_id, to, update.error.as_deref());
    get_required(ctrl, test_id)
}

/// Operator cancellation: flips the row and tells the agent to stop the
/// container.
pub fn cancel(ctrl: &Controller, test_id: &str) -> Result<QuickTestRecord, KittError> {
    let test = get_required(ctrl, test_id)?;
    if test.status.is_terminal() {
        return Err(KittError::Conflict(format!(
            "test {test_id} already {}",
            test.status
        )));
    }
    ctrl.store
        .set_quick_test_status(test_id, TestStatus::Cancelled, None)?;
    publish_status(ctrl, test_id, TestStatus::Cancelled, None);
    queue_stop(ctrl, &test);
    get_required(ctrl, test_id)
}

/// Appends a batch of agent log lines: published per line so subscribers see
/// them live, persisted by the bus as a side effect.
pub fn append_logs(
    ctrl: &Controller,
    test_id: &str,
    batch: &[LogLine],
) -> Result<(), KittError> {
    get_required(ctrl, test_id)?;
    let source = SourceId::QuickTest(test_id.to_string());
    for line in batch {
        ctrl.bus.publish(
            &source,
            ControlEvent::Log {
                line: line.line.clone(),
            },
        )?;
    }
    Ok(())
}

/// Stored log lines for a test, oldest first.
pub fn logs(ctrl: &Controller, test_id: &str) -> Result<Vec<LogEntry>, KittError> {
    get_required(ctrl, test_id)?;
    Ok(ctrl.store.quick_test_logs(test_id)?)
}

fn get_required(ctrl: &Controller, test_id: &str) -> Result<QuickTestRecord, KittError> {
    ctrl.store
        .get_quick_test(test_id)?
        .ok_or_else(|| KittError::NotFound(format!("quick test {test_id}")))
}

fn publish_status(ctrl: &Controller, test_id: &str, status: TestStatus, error: Option<&str>) {
    let result = ctrl.bus.publish(
        &SourceId::QuickTest(test_id.to_string()),
        ControlEvent::Status {
            status: status.as_str().to_string(),
            error: error.map(String::from),
        },
    );
    if let Err(e) = result {
        tracing::warn!(test = test_id, error = %e, "status event not published");
    }
}

fn queue_stop(ctrl: &Controller, test: &QuickTestRecord) {
    let agent = match ctrl.store.get_agent(&test.agent_id) {
        Ok(Some(a)) => a,
        _ => return,
    };
    if agent.is_test_agent {
        // The simulation task notices the cancelled row on its own.
        return;
    }
    let payload = StopContainerPayload {
        test_id: test.id.clone(),
    };
    let cmd = WireCommand {
        id: Uuid::new_v4().to_string(),
        kind: CommandKind::StopContainer,
        payload: serde_json::to_value(&payload).unwrap_or_default(),
    };
    if let Err(e) = ctrl.agents.queue_command(&agent.id, cmd) {
        tracing::warn!(test = %test.id, agent = %agent.name, error = %e, "stop_container not queued");
    }
}

/// Per-test wall-clock watchdog. A test still not terminal when it fires is
/// failed with [`TIMEOUT_ERROR`] and its agent is told to stop the container.
fn spawn_watchdog(ctrl: Arc<Controller>, test_id: String) {
    let deadline = ctrl.tuning.test_watchdog;
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        let result = ctrl
            .run_blocking(move |ctrl| {
                let test = get_required(ctrl, &test_id)?;
                if test.status.is_terminal() {
                    return Ok(());
                }
                tracing::warn!(test = %test_id, "watchdog fired, failing test");
                ctrl.store
                    .set_quick_test_status(&test_id, TestStatus::Failed, Some(TIMEOUT_ERROR))?;
                publish_status(ctrl, &test_id, TestStatus::Failed, Some(TIMEOUT_ERROR));
                queue_stop(ctrl, &test);
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "watchdog pass failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Tuning;
    use crate::store::sqlite::SqliteStore;
    use crate::store::Store;
    use std::time::Duration;
    use stream_event::{CpuArch, HardwareInfo, RegisterRequest};

    fn controller(tuning: Tuning) -> (tempfile::TempDir, Arc<Controller>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> =
            Arc::new(SqliteStore::open(dir.path().join("kitt.db")).unwrap());
        store.migrate().unwrap();
        (dir, Controller::new(store, tuning))
    }

    fn register_real(ctrl: &Arc<Controller>, name: &str, arch: CpuArch) -> String {
        ctrl.agents
            .register(&RegisterRequest {
                agent_id: None,
                name: name.into(),
                host: "10.0.0.5".into(),
                port: 9101,
                cpu_arch: arch,
                hardware: HardwareInfo {
                    gpu: "RTX 4090".into(),
                    cpu: "EPYC".into(),
                    ram_gb: 64.0,
                    compute_capability: Some("8.9".into()),
                    environment_type: "baremetal".into(),
                    vram_gb: Some(24.0),
                },
                kitt_version: "0.2.0".into(),
            })
            .unwrap()
            .agent_id
    }

    #[test]
    fn transition_edges_match_state_machine() {
        use TestStatus::*;
        assert!(transition_allowed(Queued, Dispatched));
        assert!(transition_allowed(Dispatched, Running));
        assert!(transition_allowed(Running, Completed));
        assert!(transition_allowed(Running, Cancelled));
        assert!(!transition_allowed(Completed, Running));
        assert!(!transition_allowed(Cancelled, Running));
        assert!(!transition_allowed(Queued, Completed));
        assert!(!transition_allowed(Failed, Completed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preflight_rejects_before_any_command_is_queued() {
        let (_dir, ctrl) = controller(Tuning::default());
        let agent_id = register_real(&ctrl, "nodeA", CpuArch::Arm64);
        let err = dispatch(
            &ctrl,
            DispatchRequest {
                agent: "nodeA".into(),
                model: "/m/llama-7b.safetensors".into(),
                engine: "tgi".into(),
                suite: "smoke".into(),
                force: false,
                campaign_id: None,
                format: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KittError::Preflight { .. }));
        assert!(ctrl.agents.pending_commands(&agent_id).unwrap().is_empty());
        // And no row was left behind either.
        let tests = ctrl
            .store
            .list_quick_tests(&QuickTestFilter::default())
            .unwrap();
        assert!(tests.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn real_agent_path_queues_run_test_and_tracks_status() {
        let (_dir, ctrl) = controller(Tuning::default());
        let agent_id = register_real(&ctrl, "nodeA", CpuArch::Amd64);
        let test = dispatch(
            &ctrl,
            DispatchRequest {
                agent: agent_id.clone(),
                model: "/m/llama-7b-q4.gguf".into(),
                engine: "llama_cpp".into(),
                suite: "smoke".into(),
                force: false,
                campaign_id: None,
                format: None,
            },
        )
        .await
        .unwrap();
        let pending = ctrl.agents.pending_commands(&agent_id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, CommandKind::RunTest);

        // Second dispatch while one is in flight violates the per-agent cap.
        let err = dispatch(
            &ctrl,
            DispatchRequest {
                agent: agent_id.clone(),
                model: "/m/llama-7b-q4.gguf".into(),
                engine: "llama_cpp".into(),
                suite: "smoke".into(),
                force: false,
                campaign_id: None,
                format: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KittError::Conflict(_)));

        mark_dispatched(&ctrl, &test.id).unwrap();
        let running = record_status(
            &ctrl,
            &test.id,
            &StatusUpdate {
                status: ReportedStatus::Running,
                error: None,
                metrics_json: None,
            },
        )
        .unwrap();
        assert_eq!(running.status, TestStatus::Running);

        let done = record_status(
            &ctrl,
            &test.id,
            &StatusUpdate {
                status: ReportedStatus::Completed,
                error: None,
                metrics_json: Some(serde_json::json!({"throughput_tps": 125.0})),
            },
        )
        .unwrap();
        assert_eq!(done.status, TestStatus::Completed);
        let run_id = done.result_id.expect("result linked");
        let run = ctrl.store.get_run(&run_id).unwrap().unwrap();
        let blob: serde_json::Value = serde_json::from_str(&run.raw_json).unwrap();
        assert_eq!(blob["throughput_tps"], 125.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn out_of_order_transition_is_conflict() {
        let (_dir, ctrl) = controller(Tuning::default());
        let agent_id = register_real(&ctrl, "nodeA", CpuArch::Amd64);
        let test = dispatch(
            &ctrl,
            DispatchRequest {
                agent: agent_id,
                model: "/m/llama-7b-q4.gguf".into(),
                engine: "llama_cpp".into(),
                suite: "smoke".into(),
                force: false,
                campaign_id: None,
                format: None,
            },
        )
        .await
        .unwrap();
        // completed straight from queued is not an edge.
        let err = record_status(
            &ctrl,
            &test.id,
            &StatusUpdate {
                status: ReportedStatus::Completed,
                error: None,
                metrics_json: Some(serde_json::json!({})),
            },
        )
        .unwrap_err();
        assert!(matches!(err, KittError::Conflict(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watchdog_fails_stuck_test() {
        let (_dir, ctrl) = controller(Tuning {
            test_watchdog: Duration::from_millis(50),
            ..Default::default()
        });
        let agent_id = register_real(&ctrl, "nodeA", CpuArch::Amd64);
        let test = dispatch(
            &ctrl,
            DispatchRequest {
                agent: agent_id.clone(),
                model: "/m/llama-7b-q4.gguf".into(),
                engine: "llama_cpp".into(),
                suite: "smoke".into(),
                force: false,
                campaign_id: None,
                format: None,
            },
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = ctrl.store.get_quick_test(&test.id).unwrap().unwrap();
        assert_eq!(after.status, TestStatus::Failed);
        assert_eq!(after.error.as_deref(), Some(TIMEOUT_ERROR));
        // Agent was told to stop whatever may be running.
        let kinds: Vec<_> = ctrl
            .agents
            .pending_commands(&agent_id)
            .unwrap()
            .into_iter()
            .map(|c| c.kind)
            .collect();
        assert!(kinds.contains(&CommandKind::StopContainer));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_flips_row_and_queues_stop() {
        let (_dir, ctrl) = controller(Tuning::default());
        let agent_id = register_real(&ctrl, "nodeA", CpuArch::Amd64);
        let test = dispatch(
            &ctrl,
            DispatchRequest {
                agent: agent_id.clone(),
                model: "/m/llama-7b-q4.gguf".into(),
                engine: "llama_cpp".into(),
                suite: "smoke".into(),
                force: false,
                campaign_id: None,
                format: None,
            },
        )
        .await
        .unwrap();
        let cancelled = cancel(&ctrl, &test.id).unwrap();
        assert_eq!(cancelled.status, TestStatus::Cancelled);
        assert!(cancel(&ctrl, &test.id).is_err());
        let kinds: Vec<_> = ctrl
            .agents
            .pending_commands(&agent_id)
            .unwrap()
            .into_iter()
            .map(|c| c.kind)
            .collect();
        assert!(kinds.contains(&CommandKind::StopContainer));
    }
}
