//! Campaign lifecycle: draft → queued → running → terminal, driven by one
//! executor task per active campaign.
//!
//! The executor and the quick-test dispatcher share no state; they meet only
//! in the store and on the event bus. Cancellation is observed by re-reading
//! the campaign row between steps.

pub mod config;
pub mod matrix;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use stream_event::{CommandKind, ControlEvent, SourceId, WireCommand};

use crate::context::Controller;
use crate::error::KittError;
use crate::quicktest::{self, DispatchRequest};
use crate::retry;
use crate::store::{
    CampaignCounters, CampaignRecord, LogEntry, QuickTestFilter, QuickTestRecord,
};
use crate::types::{AgentStatus, CampaignStatus, TestStatus};

use self::config::CampaignConfig;
use self::matrix::Cell;

/// Creates a draft campaign from YAML. The config is validated but nothing
/// runs until launch.
pub async fn create(
    ctrl: &Arc<Controller>,
    yaml: String,
    agent: Option<String>,
) -> Result<CampaignRecord, KittError> {
    ctrl.run_blocking(move |ctrl| {
        let parsed = config::parse(&yaml)?;
        let agent_id = agent
            .map(|a| resolve_agent(ctrl, &a))
            .transpose()?;
        let record = CampaignRecord {
            id: Uuid::new_v4().to_string(),
            name: parsed.campaign_name.clone(),
            description: parsed.description.clone(),
            config_yaml: yaml.clone(),
            status: CampaignStatus::Draft,
            agent_id,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            counters: CampaignCounters::default(),
            error: None,
        };
        ctrl.store.insert_campaign(&record)?;
        tracing::info!(campaign = %record.id, name = %record.name, "campaign created");
        Ok(record)
    })
    .await
}

/// Replaces the config of a draft campaign. Any other status conflicts.
pub async fn update_config(
    ctrl: &Arc<Controller>,
    id: String,
    yaml: String,
) -> Result<CampaignRecord, KittError> {
    ctrl.run_blocking(move |ctrl| {
        let campaign = get_required(ctrl, &id)?;
        if campaign.status != CampaignStatus::Draft {
            return Err(KittError::Conflict(format!(
                "campaign {id} is {}, only drafts can be edited",
                campaign.status
            )));
        }
        let parsed = config::parse(&yaml)?;
        ctrl.store.update_campaign_config(
            &id,
            &parsed.campaign_name,
            parsed.description.as_deref(),
            &yaml,
        )?;
        get_required(ctrl, &id)
    })
    .await
}

/// Launches a draft (or re-launches a failed/cancelled campaign, resuming
/// past completed cells). Spawns the executor task and returns immediately.
pub async fn launch(
    ctrl: &Arc<Controller>,
    id: String,
    agent_override: Option<String>,
) -> Result<CampaignRecord, KittError> {
    let record = {
        let id = id.clone();
        ctrl.run_blocking(move |ctrl| {
            let campaign = get_required(ctrl, &id)?;
            match campaign.status {
                CampaignStatus::Draft | CampaignStatus::Failed | CampaignStatus::Cancelled => {}
                other => {
                    return Err(KittError::Conflict(format!(
                        "campaign {id} is {other}, not launchable"
                    )))
                }
            }
            let parsed = config::parse(&campaign.config_yaml)?;
            if parsed.parallel {
                // Agents report a single GPU; concurrent cells would contend
                // for it and break the one-test-per-agent rule.
                return Err(KittError::Validation(
                    "parallel: true is not supported on single-GPU agents".into(),
                ));
            }
            let agent_id = match agent_override {
                Some(a) => resolve_agent(ctrl, &a)?,
                None => campaign.agent_id.clone().ok_or_else(|| {
                    KittError::Validation(format!("campaign {id} has no assigned agent"))
                })?,
            };
            let agent = ctrl
                .store
                .get_agent(&agent_id)?
                .ok_or_else(|| KittError::NotFound(format!("agent {agent_id}")))?;
            if agent.status == AgentStatus::Offline && !agent.is_test_agent {
                return Err(KittError::Conflict(format!(
                    "agent {} is offline",
                    agent.name
                )));
            }
            ctrl.store.set_campaign_agent(&id, &agent_id)?;
            ctrl.store
                .set_campaign_status(&id, CampaignStatus::Queued, None)?;
            publish_campaign_status(ctrl, &id, CampaignStatus::Queued);
            get_required(ctrl, &id)
        })
        .await?
    };

    let executor_ctrl = Arc::clone(ctrl);
    let campaign_id = record.id.clone();
    tokio::spawn(async move {
        if let Err(e) = run_campaign(executor_ctrl, campaign_id.clone()).await {
            tracing::error!(campaign = %campaign_id, error = %e, "campaign executor failed");
        }
    });
    Ok(record)
}

/// Cancels a queued or running campaign and its in-flight quick test.
pub async fn cancel(ctrl: &Arc<Controller>, id: String) -> Result<CampaignRecord, KittError> {
    ctrl.run_blocking(move |ctrl| {
        let campaign = get_required(ctrl, &id)?;
        match campaign.status {
            CampaignStatus::Queued | CampaignStatus::Running => {}
            other => {
                return Err(KittError::Conflict(format!(
                    "campaign {id} is {other}, nothing to cancel"
                )))
            }
        }
        ctrl.store
            .set_campaign_status(&id, CampaignStatus::Cancelled, None)?;
        publish_campaign_status(ctrl, &id, CampaignStatus::Cancelled);
        log_line(ctrl, &id, "campaign cancelled by operator".to_string());

        // Propagate to whatever cell is in flight.
        let active = ctrl.store.list_quick_tests(&QuickTestFilter {
            campaign_id: Some(id.clone()),
            active: true,
            ..Default::default()
        })?;
        for test in active {
            if let Err(e) = quicktest::cancel(ctrl, &test.id) {
                tracing::warn!(test = %test.id, error = %e, "in-flight test not cancelled");
            }
        }
        get_required(ctrl, &id)
    })
    .await
}

/// The executor task body: expand, walk cells in order, track counters.
async fn run_campaign(ctrl: Arc<Controller>, id: String) -> Result<(), KittError> {
    let (campaign, parsed, expansion) = {
        let id = id.clone();
        ctrl.run_blocking(move |ctrl| {
            let campaign = get_required(ctrl, &id)?;
            let parsed: CampaignConfig = config::parse(&campaign.config_yaml)?;
            let free_disk = campaign
                .agent_id
                .as_deref()
                .and_then(|a| ctrl.store.get_agent(a).ok().flatten())
                .map(|a| a.telemetry.storage_free_gb)
                .filter(|gb| *gb > 0.0);
            let expansion = matrix::expand(&parsed, free_disk)?;
            Ok((campaign, parsed, expansion))
        })
        .await?
    };
    let agent_id = campaign
        .agent_id
        .clone()
        .ok_or_else(|| KittError::Fatal("launched campaign without agent".into()))?;

    let mut counters = CampaignCounters {
        total_runs: expansion.total(),
        succeeded: 0,
        failed: 0,
        skipped: expansion.skipped.len() as u32,
    };

    {
        let id = id.clone();
        let counters = counters;
        let skipped = expansion.skipped.clone();
        ctrl.run_blocking(move |ctrl| {
            ctrl.store
                .set_campaign_status(&id, CampaignStatus::Running, None)?;
            publish_campaign_status(ctrl, &id, CampaignStatus::Running);
            for cell in &skipped {
                log_line(
                    ctrl,
                    &id,
                    format!(
                        "skipping: {}/{}/{} ({})",
                        cell.model, cell.engine, cell.suite, cell.reason
                    ),
                );
            }
            ctrl.store.update_campaign_counters(&id, &counters)?;
            publish_progress(ctrl, &id, &counters);
            Ok(())
        })
        .await?;
    }

    let mut cancelled = false;
    for cell in &expansion.cells {
        if campaign_cancelled(&ctrl, &id).await? {
            cancelled = true;
            break;
        }
        match run_cell(&ctrl, &id, &agent_id, cell, &parsed).await? {
            CellOutcome::Succeeded => counters.succeeded += 1,
            CellOutcome::Failed => counters.failed += 1,
            CellOutcome::CampaignCancelled => {
                cancelled = true;
            }
        }
        {
            let id = id.clone();
            let counters = counters;
            ctrl.run_blocking(move |ctrl| {
                ctrl.store.update_campaign_counters(&id, &counters)?;
                publish_progress(ctrl, &id, &counters);
                Ok(())
            })
            .await?;
        }
        if cancelled {
            break;
        }
    }

    let final_status = if cancelled || campaign_cancelled(&ctrl, &id).await? {
        CampaignStatus::Cancelled
    } else if counters.failed > 0 {
        CampaignStatus::Failed
    } else {
        CampaignStatus::Completed
    };
    {
        let id = id.clone();
        ctrl.run_blocking(move |ctrl| {
            // Cancel already set the row; only the executor's own endings
            // are written here.
            if final_status != CampaignStatus::Cancelled {
                ctrl.store.set_campaign_status(&id, final_status, None)?;
                publish_campaign_status(ctrl, &id, final_status);
            }
            log_line(ctrl, &id, format!("campaign finished: {final_status}"));
            Ok(())
        })
        .await?;
    }
    tracing::info!(campaign = %id, status = %final_status, "campaign finished");
    Ok(())
}

enum CellOutcome {
    Succeeded,
    Failed,
    CampaignCancelled,
}

async fn run_cell(
    ctrl: &Arc<Controller>,
    campaign_id: &str,
    agent_id: &str,
    cell: &Cell,
    parsed: &CampaignConfig,
) -> Result<CellOutcome, KittError> {
    // Resume: a cell whose quick test already completed is not re-run.
    let prior = {
        let campaign_id = campaign_id.to_string();
        let cell_engine = cell.engine.clone();
        let cell_artifact = cell.artifact.clone();
        let cell_suite = cell.suite.clone();
        ctrl.run_blocking(move |ctrl| {
            let tests = ctrl.store.list_quick_tests(&QuickTestFilter {
                campaign_id: Some(campaign_id),
                status: Some(TestStatus::Completed),
                ..Default::default()
            })?;
            Ok(tests.into_iter().any(|t| {
                t.model == cell_artifact && t.engine == cell_engine && t.suite == cell_suite
            }))
        })
        .await?
    };
    if prior {
        let campaign_id = campaign_id.to_string();
        let key = cell.key();
        ctrl.run_blocking(move |ctrl| {
            log_line(ctrl, &campaign_id, format!("already completed: {key}"));
            Ok(())
        })
        .await?;
        return Ok(CellOutcome::Succeeded);
    }

    {
        let campaign_id = campaign_id.to_string();
        let line = format!("starting: {}/{}/{}", cell.model.name, cell.engine, cell.suite);
        ctrl.run_blocking(move |ctrl| {
            log_line(ctrl, &campaign_id, line);
            Ok(())
        })
        .await?;
    }

    let req = DispatchRequest {
        agent: agent_id.to_string(),
        model: cell.artifact.clone(),
        engine: cell.engine.clone(),
        suite: cell.suite.clone(),
        force: false,
        campaign_id: Some(campaign_id.to_string()),
        format: Some(cell.format),
    };
    let dispatched = retry::retry(&retry::Backoff::default(), || {
        let ctrl = Arc::clone(ctrl);
        let req = req.clone();
        async move { quicktest::dispatch(&ctrl, req).await }
    })
    .await;
    let test = match dispatched {
        Ok(t) => t,
        Err(e) => {
            let campaign_id = campaign_id.to_string();
            let line = format!("cell failed to dispatch: {e}");
            ctrl.run_blocking(move |ctrl| {
                log_line(ctrl, &campaign_id, line);
                Ok(())
            })
            .await?;
            return Ok(CellOutcome::Failed);
        }
    };

    let outcome = wait_for_cell(ctrl, campaign_id, &test).await?;

    if matches!(outcome, CellOutcome::Succeeded) && parsed.disk.cleanup_after_run {
        let agent_id = agent_id.to_string();
        ctrl.run_blocking(move |ctrl| {
            let cmd = WireCommand {
                id: Uuid::new_v4().to_string(),
                kind: CommandKind::CleanupStorage,
                payload: serde_json::json!({}),
            };
            if let Err(e) = ctrl.agents.queue_command(&agent_id, cmd) {
                tracing::warn!(agent = %agent_id, error = %e, "cleanup_storage not queued");
            }
            Ok(())
        })
        .await?;
    }
    Ok(outcome)
}

/// Polls the quick test to a terminal state, re-publishing its log lines onto
/// the campaign channel while waiting.
async fn wait_for_cell(
    ctrl: &Arc<Controller>,
    campaign_id: &str,
    test: &QuickTestRecord,
) -> Result<CellOutcome, KittError> {
    let mut sub = ctrl
        .bus
        .subscribe(Some(SourceId::QuickTest(test.id.clone())));
    loop {
        // Forward buffered quick-test output to campaign subscribers.
        let mut forwarded = Vec::new();
        while let Some(ev) = sub.try_recv() {
            if let Some(line) = ev.event.log_line() {
                forwarded.push(line.to_string());
            }
        }
        if !forwarded.is_empty() {
            let campaign_id = campaign_id.to_string();
            ctrl.run_blocking(move |ctrl| {
                for line in forwarded {
                    log_line(ctrl, &campaign_id, line);
                }
                Ok(())
            })
            .await?;
        }

        let (status, campaign_gone) = {
            let test_id = test.id.clone();
            let campaign_id = campaign_id.to_string();
            ctrl.run_blocking(move |ctrl| {
                let status = ctrl
                    .store
                    .get_quick_test(&test_id)?
                    .map(|t| t.status)
                    .unwrap_or(TestStatus::Failed);
                let campaign = get_required(ctrl, &campaign_id)?;
                Ok((status, campaign.status == CampaignStatus::Cancelled))
            })
            .await?
        };
        match status {
            TestStatus::Completed => {
                let campaign_id = campaign_id.to_string();
                let test_id = test.id.clone();
                ctrl.run_blocking(move |ctrl| {
                    log_line(ctrl, &campaign_id, format!("cell completed: {test_id}"));
                    Ok(())
                })
                .await?;
                return Ok(CellOutcome::Succeeded);
            }
            TestStatus::Failed => {
                let campaign_id = campaign_id.to_string();
                let test_id = test.id.clone();
                ctrl.run_blocking(move |ctrl| {
                    log_line(ctrl, &campaign_id, format!("cell failed: {test_id}"));
                    Ok(())
                })
                .await?;
                return Ok(CellOutcome::Failed);
            }
            TestStatus::Cancelled => {
                return Ok(if campaign_gone {
                    CellOutcome::CampaignCancelled
                } else {
                    CellOutcome::Failed
                });
            }
            _ if campaign_gone => {
                // Cancellation raced us; the cancel path flips the test.
                return Ok(CellOutcome::CampaignCancelled);
            }
            _ => {}
        }
        tokio::time::sleep(ctrl.tuning.campaign_poll).await;
    }
}

async fn campaign_cancelled(ctrl: &Arc<Controller>, id: &str) -> Result<bool, KittError> {
    let id = id.to_string();
    ctrl.run_blocking(move |ctrl| {
        Ok(get_required(ctrl, &id)?.status == CampaignStatus::Cancelled)
    })
    .await
}

fn resolve_agent(ctrl: &Controller, key: &str) -> Result<String, KittError> {
    if let Some(agent) = ctrl.store.get_agent(key)? {
        return Ok(agent.id);
    }
    ctrl.store
        .get_agent_by_name(key)?
        .map(|a| a.id)
        .ok_or_else(|| KittError::NotFound(format!("agent {key}")))
}

fn get_required(ctrl: &Controller, id: &str) -> Result<CampaignRecord, KittError> {
    ctrl.store
        .get_campaign(id)?
        .ok_or_else(|| KittError::NotFound(format!("campaign {id}")))
}

fn log_line(ctrl: &Controller, campaign_id: &str, line: String) {
    let result = ctrl.bus.publish(
        &SourceId::Campaign(campaign_id.to_string()),
        ControlEvent::Log { line },
    );
    if let Err(e) = result {
        tracing::warn!(campaign = campaign_id, error = %e, "campaign log not published");
    }
}

fn publish_campaign_status(ctrl: &Controller, id: &str, status: CampaignStatus) {
    let result = ctrl.bus.publish(
        &SourceId::Campaign(id.to_string()),
        ControlEvent::CampaignStatus {
            status: status.as_str().to_string(),
        },
    );
    if let Err(e) = result {
        tracing::warn!(campaign = id, error = %e, "campaign status not published");
    }
}

fn publish_progress(ctrl: &Controller, id: &str, counters: &CampaignCounters) {
    let result = ctrl.bus.publish(
        &SourceId::Campaign(id.to_string()),
        ControlEvent::Progress {
            total_runs: counters.total_runs,
            succeeded: counters.succeeded,
            failed: counters.failed,
            skipped: counters.skipped,
        },
    );
    if let Err(e) = result {
        tracing::warn!(campaign = id, error = %e, "progress not published");
    }
}

/// Per-log-entry view used by the HTTP layer.
pub async fn logs(ctrl: &Arc<Controller>, id: String) -> Result<Vec<LogEntry>, KittError> {
    ctrl.run_blocking(move |ctrl| {
        get_required(ctrl, &id)?;
        Ok(ctrl.store.campaign_logs(&id)?)
    })
    .await
}
