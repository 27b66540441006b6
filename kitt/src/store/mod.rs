//! Persistence: a narrow, driver-pluggable store interface.
//!
//! All components go through [`Store`]; nothing else touches the database.
//! Two drivers exist: the embedded file database ([`sqlite::SqliteStore`],
//! default `<home>/kitt.db`) and the server database
//! (`postgres::PostgresStore`, behind the `postgres` feature) for
//! multi-controller deployments. Both expose the same tables.
//!
//! The interface is synchronous; async callers hop through
//! `tokio::task::spawn_blocking` (see [`crate::context::Controller`]).

pub mod migrate;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stream_event::{CpuArch, HardwareInfo};

use crate::types::{AgentStatus, CampaignStatus, TestStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("storage: {0}")]
    Postgres(#[from] ::postgres::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("migration {version}: {message}")]
    Migration { version: i64, message: String },
    #[error("store lock poisoned")]
    Lock,
}

/// Agent row. The raw token never appears here; only its SHA-256 hash and an
/// 8-char display prefix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub cpu_arch: CpuArch,
    pub hardware: HardwareInfo,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub is_test_agent: bool,
    #[serde(skip_serializing, default)]
    pub token_prefix: String,
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    pub kitt_version: String,
    pub telemetry: AgentTelemetry,
}

/// Rolling counters reported by heartbeats.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentTelemetry {
    pub gpu_util: f64,
    pub gpu_mem_gb: f64,
    pub storage_free_gb: f64,
    pub uptime_s: i64,
}

/// One heartbeat as persisted.
#[derive(Clone, Debug)]
pub struct HeartbeatTelemetry {
    pub status: AgentStatus,
    pub at: DateTime<Utc>,
    pub telemetry: AgentTelemetry,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuickTestRecord {
    pub id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    pub model: String,
    pub engine: String,
    pub suite: String,
    pub force: bool,
    pub status: TestStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub total_runs: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Submitted YAML, stored verbatim.
    pub config_yaml: String,
    pub status: CampaignStatus,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: CampaignCounters,
    pub error: Option<String>,
}

/// One immutable benchmark result. `raw_json` is the canonical metrics blob;
/// the benchmark/metric children are derived from it and exist for querying.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub model: String,
    pub engine: String,
    pub suite: String,
    pub timestamp: DateTime<Utc>,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub duration_seconds: f64,
    pub raw_json: String,
    pub benchmarks: Vec<BenchmarkRecord>,
    pub hardware: Option<HardwareInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub name: String,
    pub category: Option<String>,
    pub metrics: Vec<MetricRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    /// Missing values stay NULL and are skipped by aggregation.
    pub value: Option<f64>,
}

/// Listing projection of a run (no children, no blob).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub model: String,
    pub engine: String,
    pub suite: String,
    pub timestamp: DateTime<Utc>,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub duration_seconds: f64,
}

#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    pub model: Option<String>,
    pub engine: Option<String>,
    pub suite: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct QuickTestFilter {
    pub agent_id: Option<String>,
    pub campaign_id: Option<String>,
    pub status: Option<TestStatus>,
    /// Only `dispatched` / `running` rows.
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupBy {
    Model,
    Engine,
    Suite,
}

impl GroupBy {
    pub fn column(&self) -> &'static str {
        match self {
            GroupBy::Model => "model",
            GroupBy::Engine => "engine",
            GroupBy::Suite => "suite",
        }
    }
}

/// Group statistics over one metric. `stddev`/`cv` are `None` below two samples.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregateRow {
    pub group: String,
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: Option<f64>,
    /// Coefficient of variation (stddev / mean); `None` when mean is 0.
    pub cv: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub event_type: String,
    pub source: String,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
}

/// One persisted log line, stored verbatim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub line: String,
}

pub trait Store: Send + Sync {
    /// Applies pending migrations in ascending version order; forward-only.
    fn migrate(&self) -> Result<(), StoreError>;
    fn schema_version(&self) -> Result<i64, StoreError>;

    // Runs. `save_run` writes the row plus all children in one transaction.
    fn save_run(&self, run: &RunRecord) -> Result<(), StoreError>;
    fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError>;
    fn delete_run(&self, id: &str) -> Result<bool, StoreError>;
    fn query_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError>;
    /// `(group key, metric value)` pairs feeding [`Store::aggregate`]; one row
    /// per metric occurrence, NULLs included.
    fn metric_values(
        &self,
        group_by: GroupBy,
        metric: &str,
    ) -> Result<Vec<(String, Option<f64>)>, StoreError>;
    fn aggregate(&self, group_by: GroupBy, metric: &str) -> Result<Vec<AggregateRow>, StoreError> {
        Ok(aggregate_rows(self.metric_values(group_by, metric)?))
    }

    // Agents.
    fn upsert_agent(&self, agent: &AgentRecord) -> Result<(), StoreError>;
    fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>, StoreError>;
    fn get_agent_by_name(&self, name: &str) -> Result<Option<AgentRecord>, StoreError>;
    fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;
    fn delete_agent(&self, id: &str) -> Result<bool, StoreError>;
    fn record_heartbeat(&self, id: &str, beat: &HeartbeatTelemetry) -> Result<(), StoreError>;
    fn set_agent_status(&self, id: &str, status: AgentStatus) -> Result<(), StoreError>;
    fn set_agent_token(&self, id: &str, prefix: &str, hash: &str) -> Result<(), StoreError>;
    fn agent_settings(&self, agent_id: &str) -> Result<BTreeMap<String, String>, StoreError>;
    fn put_agent_setting(&self, agent_id: &str, key: &str, value: &str)
        -> Result<(), StoreError>;

    // Quick tests. `set_quick_test_status` stamps `started_at` on the first
    // `running` and `completed_at` on any terminal state.
    fn insert_quick_test(&self, test: &QuickTestRecord) -> Result<(), StoreError>;
    fn get_quick_test(&self, id: &str) -> Result<Option<QuickTestRecord>, StoreError>;
    fn list_quick_tests(&self, filter: &QuickTestFilter)
        -> Result<Vec<QuickTestRecord>, StoreError>;
    fn set_quick_test_status(
        &self,
        id: &str,
        status: TestStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
    fn link_result(&self, test_id: &str, run_id: &str) -> Result<(), StoreError>;
    fn append_quick_test_logs(&self, test_id: &str, lines: &[LogEntry])
        -> Result<(), StoreError>;
    fn quick_test_logs(&self, test_id: &str) -> Result<Vec<LogEntry>, StoreError>;

    // Campaigns.
    fn insert_campaign(&self, campaign: &CampaignRecord) -> Result<(), StoreError>;
    fn get_campaign(&self, id: &str) -> Result<Option<CampaignRecord>, StoreError>;
    fn list_campaigns(&self) -> Result<Vec<CampaignRecord>, StoreError>;
    fn set_campaign_status(
        &self,
        id: &str,
        status: CampaignStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
    fn set_campaign_agent(&self, id: &str, agent_id: &str) -> Result<(), StoreError>;
    fn update_campaign_config(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        config_yaml: &str,
    ) -> Result<(), StoreError>;
    fn update_campaign_counters(
        &self,
        id: &str,
        counters: &CampaignCounters,
    ) -> Result<(), StoreError>;
    fn append_campaign_log(&self, campaign_id: &str, entry: &LogEntry) -> Result<(), StoreError>;
    fn campaign_logs(&self, campaign_id: &str) -> Result<Vec<LogEntry>, StoreError>;

    // Events (append-only).
    fn append_event(&self, event_type: &str, source: &str, payload_json: &str)
        -> Result<u64, StoreError>;
    fn events_after(
        &self,
        seq: u64,
        source: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError>;

    // Process-wide settings.
    fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Group-by statistics over `(group, value)` pairs. NULL values are skipped;
/// a group whose values are all NULL is dropped.
pub fn aggregate_rows(values: Vec<(String, Option<f64>)>) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (group, value) in values {
        let bucket = groups.entry(group).or_default();
        if let Some(v) = value {
            bucket.push(v);
        }
    }
    groups
        .into_iter()
        .filter(|(_, vs)| !vs.is_empty())
        .map(|(group, vs)| {
            let count = vs.len() as u64;
            let mean = vs.iter().sum::<f64>() / vs.len() as f64;
            let min = vs.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = vs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let stddev = if vs.len() >= 2 {
                let var = vs.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                    / (vs.len() - 1) as f64;
                Some(var.sqrt())
            } else {
                None
            };
            let cv = stddev.and_then(|sd| (mean != 0.0).then(|| sd / mean));
            AggregateRow {
                group,
                count,
                mean,
                min,
                max,
                stddev,
                cv,
            }
        })
        .collect()
}

/// Builds a [`RunRecord`] from a metrics blob posted by an agent (or made up
/// by the simulator). Top-level numeric fields become metrics of one synthetic
/// benchmark when the blob carries no `benchmarks` array.
pub fn run_from_metrics(
    id: &str,
    model: &str,
    engine: &str,
    suite: &str,
    timestamp: DateTime<Utc>,
    metrics_json: &serde_json::Value,
    hardware: Option<HardwareInfo>,
) -> Result<RunRecord, StoreError> {
    let raw_json = serde_json::to_string(metrics_json)?;
    let mut benchmarks = Vec::new();
    if let Some(list) = metrics_json.get("benchmarks").and_then(|b| b.as_array()) {
        for entry in list {
            let name = entry
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("unnamed")
                .to_string();
            let category = entry
                .get("category")
                .and_then(|c| c.as_str())
                .map(String::from);
            let metrics = entry
                .get("metrics")
                .and_then(|m| m.as_object())
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| MetricRecord {
                            name: k.clone(),
                            value: v.as_f64(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            benchmarks.push(BenchmarkRecord {
                name,
                category,
                metrics,
            });
        }
    } else if let Some(obj) = metrics_json.as_object() {
        let metrics: Vec<MetricRecord> = obj
            .iter()
            .filter(|(_, v)| v.is_number() || v.is_null())
            .map(|(k, v)| MetricRecord {
                name: k.clone(),
                value: v.as_f64(),
            })
            .collect();
        if !metrics.is_empty() {
            benchmarks.push(BenchmarkRecord {
                name: suite.to_string(),
                category: None,
                metrics,
            });
        }
    }
    let total = metrics_json.get("total").and_then(|v| v.as_i64()).unwrap_or(0);
    let passed = metrics_json
        .get("passed")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let failed = metrics_json
        .get("failed")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let duration_seconds = metrics_json
        .get("duration_seconds")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    Ok(RunRecord {
        id: id.to_string(),
        model: model.to_string(),
        engine: engine.to_string(),
        suite: suite.to_string(),
        timestamp,
        total,
        passed,
        failed,
        duration_seconds,
        raw_json,
        benchmarks,
        hardware,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_skips_nulls_and_empty_groups() {
        let rows = aggregate_rows(vec![
            ("llama".into(), Some(100.0)),
            ("llama".into(), Some(110.0)),
            ("llama".into(), None),
            ("qwen".into(), None),
        ]);
        assert_eq!(rows.len(), 1);
        let llama = &rows[0];
        assert_eq!(llama.group, "llama");
        assert_eq!(llama.count, 2);
        assert!((llama.mean - 105.0).abs() < 1e-9);
        assert_eq!(llama.min, 100.0);
        assert_eq!(llama.max, 110.0);
        let sd = llama.stddev.unwrap();
        assert!((sd - (50.0_f64).sqrt()).abs() < 1e-9);
        assert!((llama.cv.unwrap() - sd / 105.0).abs() < 1e-12);
    }

    #[test]
    fn aggregate_single_sample_has_no_stddev() {
        let rows = aggregate_rows(vec![("m".into(), Some(4.0))]);
        assert_eq!(rows[0].count, 1);
        assert!(rows[0].stddev.is_none());
        assert!(rows[0].cv.is_none());
    }

    #[test]
    fn run_from_flat_metrics_blob() {
        let blob = serde_json::json!({
            "throughput_tps": 125.0,
            "latency_ms": 12.5,
            "total": 10, "passed": 9, "failed": 1,
            "duration_seconds": 42.0
        });
        let run = run_from_metrics(
            "r-1",
            "llama-7b",
            "llama_cpp",
            "smoke",
            Utc::now(),
            &blob,
            None,
        )
        .unwrap();
        assert_eq!(run.total, 10);
        assert_eq!(run.passed, 9);
        assert_eq!(run.benchmarks.len(), 1);
        let names: Vec<_> = run.benchmarks[0]
            .metrics
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert!(names.contains(&"throughput_tps"));
        // Canonical blob survives verbatim.
        let parsed: serde_json::Value = serde_json::from_str(&run.raw_json).unwrap();
        assert_eq!(parsed, blob);
    }

    #[test]
    fn run_from_structured_metrics_blob() {
        let blob = serde_json::json!({
            "benchmarks": [
                {"name": "mmlu", "category": "accuracy",
                 "metrics": {"score": 0.71, "missing": null}},
                {"name": "throughput", "metrics": {"tps": 98.4}}
            ]
        });
        let run =
            run_from_metrics("r-2", "m", "vllm", "full", Utc::now(), &blob, None).unwrap();
        assert_eq!(run.benchmarks.len(), 2);
        assert_eq!(run.benchmarks[0].category.as_deref(), Some("accuracy"));
        assert_eq!(
            run.benchmarks[0]
                .metrics
                .iter()
                .find(|m| m.name == "missing")
                .unwrap()
                .value,
            None
        );
    }
}
