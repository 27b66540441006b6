//! Simulated execution for test agents. Walks the same state machine as a
//! real run, emitting plausible log lines and metrics, with a cancellation
//! check between steps.

use std::sync::Arc;

use rand::Rng;

use stream_event::{ControlEvent, ReportedStatus, SourceId, StatusUpdate};

use crate::context::Controller;
use crate::error::KittError;
use crate::store::QuickTestRecord;

pub(crate) fn spawn(ctrl: Arc<Controller>, test: QuickTestRecord) {
    tokio::spawn(async move {
        if let Err(e) = run(ctrl, test).await {
            tracing::warn!(error = %e, "simulation task failed");
        }
    });
}

async fn run(ctrl: Arc<Controller>, test: QuickTestRecord) -> Result<(), KittError> {
    let test_id = test.id.clone();

    step_delay(&ctrl).await;
    if cancelled(&ctrl, &test_id).await? {
        return Ok(());
    }
    {
        let id = test_id.clone();
        ctrl.run_blocking(move |ctrl| super::mark_dispatched(ctrl, &id)).await?;
    }

    emit_log(&ctrl, &test_id, format!("pulling image for engine {}", test.engine)).await?;
    step_delay(&ctrl).await;
    if cancelled(&ctrl, &test_id).await? {
        return Ok(());
    }

    emit_log(&ctrl, &test_id, format!("loading model {}", test.model)).await?;
    {
        let id = test_id.clone();
        ctrl.run_blocking(move |ctrl| {
            super::record_status(
                ctrl,
                &id,
                &StatusUpdate {
                    status: ReportedStatus::Running,
                    error: None,
                    metrics_json: None,
                },
            )
            .map(|_| ())
        })
        .await?;
    }

    let mut elapsed_s = 0.0;
    for step in 1..=3 {
        step_delay(&ctrl).await;
        if cancelled(&ctrl, &test_id).await? {
            return Ok(());
        }
        let tps: f64 = rand::thread_rng().gen_range(80.0..140.0);
        elapsed_s += rand::thread_rng().gen_range(20.0..60.0);
        emit_log(
            &ctrl,
            &test_id,
            format!("t={elapsed_s:.0}s step={step}/3 tok/s={tps:.1}"),
        )
        .await?;
    }

    step_delay(&ctrl).await;
    if cancelled(&ctrl, &test_id).await? {
        return Ok(());
    }

    let metrics = synthetic_metrics(&test.suite, elapsed_s);
    {
        let id = test_id.clone();
        ctrl.run_blocking(move |ctrl| {
            super::record_status(
                ctrl,
                &id,
                &StatusUpdate {
                    status: ReportedStatus::Completed,
                    error: None,
                    metrics_json: Some(metrics),
                },
            )
            .map(|_| ())
        })
        .await?;
    }
    Ok(())
}

/// Plausible metrics for a simulated run: throughput, latency, memory, and
/// an accuracy score, all inside realistic ranges.
fn synthetic_metrics(suite: &str, duration_s: f64) -> serde_json::Value {
    let mut rng = rand::thread_rng();
    let throughput: f64 = rng.gen_range(80.0..140.0);
    let latency_ms: f64 = rng.gen_range(8.0..25.0);
    let memory_gb: f64 = rng.gen_range(4.0..20.0);
    let accuracy: f64 = rng.gen_range(0.6..0.9);
    let total = rng.gen_range(10..40);
    let failed = rng.gen_range(0..2);
    serde_json::json!({
        "throughput_tps": (throughput * 10.0).round() / 10.0,
        "latency_p50_ms": (latency_ms * 10.0).round() / 10.0,
        "gpu_memory_gb": (memory_gb * 10.0).round() / 10.0,
        "accuracy": (accuracy * 1000.0).round() / 1000.0,
        "total": total,
        "passed": total - failed,
        "failed": failed,
        "duration_seconds": (duration_s * 10.0).round() / 10.0,
        "benchmarks": [
            {
                "name": suite,
                "category": "simulated",
                "metrics": {
                    "throughput_tps": (throughput * 10.0).round() / 10.0,
                    "latency_p50_ms": (latency_ms * 10.0).round() / 10.0,
                    "accuracy": (accuracy * 1000.0).round() / 1000.0
                }
            }
        ]
    })
}

async fn step_delay(ctrl: &Arc<Controller>) {
    let (lo, hi) = ctrl.tuning.simulate_step_ms;
    let ms = if hi > lo {
        rand::thread_rng().gen_range(lo..hi)
    } else {
        lo
    };
    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
}

async fn cancelled(ctrl: &Arc<Controller>, test_id: &str) -> Result<bool, KittError> {
    let id = test_id.to_string();
    let status = ctrl
        .run_blocking(move |ctrl| {
            Ok(ctrl.store.get_quick_test(&id)?.map(|t| t.status))
        })
        .await?;
    match status {
        Some(s) if s.is_terminal() => Ok(true),
        Some(_) => Ok(false),
        // Row deleted under us; nothing left to simulate.
        None => Ok(true),
    }
}

async fn emit_log(
    ctrl: &Arc<Controller>,
    test_id: &str,
    line: String,
) -> Result<(), KittError> {
    let id = test_id.to_string();
    ctrl.run_blocking(move |ctrl| {
        ctrl.bus
            .publish(&SourceId::QuickTest(id.clone()), ControlEvent::Log { line })
            .map(|_| ())
    })
    .await
}
