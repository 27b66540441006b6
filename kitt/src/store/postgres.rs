//! Server-database driver for multi-controller deployments.
//!
//! Same interface and tables as the file driver with the dialect type
//! mapping applied. JSON blobs go through `$n::json` casts so the stored
//! text stays verbatim and exports remain lossless.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use postgres::{Client, NoTls, Row};

use stream_event::{CpuArch, HardwareInfo};

use super::migrate;
use super::{
    AgentRecord, AgentTelemetry, BenchmarkRecord, CampaignCounters, CampaignRecord, EventRecord,
    GroupBy, HeartbeatTelemetry, LogEntry, MetricRecord, QuickTestFilter, QuickTestRecord,
    RunFilter, RunRecord, RunSummary, Store, StoreError,
};
use crate::types::{AgentStatus, CampaignStatus, TestStatus};

pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    /// Connects using a standard DSN (`KITT_DB_DSN`). Call [`Store::migrate`]
    /// before first use.
    pub fn connect(dsn: &str) -> Result<Self, StoreError> {
        let client = Client::connect(dsn, NoTls)?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Client>, StoreError> {
        self.client.lock().map_err(|_| StoreError::Lock)
    }
}

fn parse_status<T: std::str::FromStr<Err = String>>(s: String) -> Result<T, StoreError> {
    s.parse::<T>().map_err(StoreError::Corrupt)
}

const AGENT_COLS: &str = "id, name, host, port, cpu_arch, gpu, cpu, ram_gb, compute_capability, \
     environment_type, vram_gb, status, last_heartbeat, registered_at, is_test_agent, \
     token_prefix, token_hash, kitt_version, gpu_util, gpu_mem_gb, storage_free_gb, uptime_s";

fn map_agent(row: &Row) -> Result<AgentRecord, StoreError> {
    let cpu_arch: String = row.get(4);
    Ok(AgentRecord {
        id: row.get(0),
        name: row.get(1),
        host: row.get(2),
        port: row.get::<_, i32>(3) as u16,
        cpu_arch: match cpu_arch.as_str() {
            "amd64" => CpuArch::Amd64,
            "arm64" => CpuArch::Arm64,
            other => return Err(StoreError::Corrupt(format!("cpu_arch {other:?}"))),
        },
        hardware: HardwareInfo {
            gpu: row.get(5),
            cpu: row.get(6),
            ram_gb: row.get(7),
            compute_capability: row.get(8),
            environment_type: row.get(9),
            vram_gb: row.get(10),
        },
        status: parse_status::<AgentStatus>(row.get(11))?,
        last_heartbeat: row.get(12),
        registered_at: row.get(13),
        is_test_agent: row.get(14),
        token_prefix: row.get(15),
        token_hash: row.get(16),
        kitt_version: row.get(17),
        telemetry: AgentTelemetry {
            gpu_util: row.get(18),
            gpu_mem_gb: row.get(19),
            storage_free_gb: row.get(20),
            uptime_s: row.get(21),
        },
    })
}

const QT_COLS: &str = "id, agent_id, campaign_id, model, engine, suite, force_dispatch, status, \
     created_at, started_at, completed_at, result_id, error";

fn map_quick_test(row: &Row) -> Result<QuickTestRecord, StoreError> {
    Ok(QuickTestRecord {
        id: row.get(0),
        agent_id: row.get(1),
        campaign_id: row.get(2),
        model: row.get(3),
        engine: row.get(4),
        suite: row.get(5),
        force: row.get(6),
        status: parse_status::<TestStatus>(row.get(7))?,
        created_at: row.get(8),
        started_at: row.get(9),
        completed_at: row.get(10),
        result_id: row.get(11),
        error: row.get(12),
    })
}

const CAMPAIGN_COLS: &str = "id, name, description, config_yaml, status, agent_id, created_at, \
     started_at, completed_at, total_runs, succeeded, failed, skipped, error";

fn map_campaign(row: &Row) -> Result<CampaignRecord, StoreError> {
    Ok(CampaignRecord {
        id: row.get(0),
        name: row.get(1),
        description: row.get(2),
        config_yaml: row.get(3),
        status: parse_status::<CampaignStatus>(row.get(4))?,
        agent_id: row.get(5),
        created_at: row.get(6),
        started_at: row.get(7),
        completed_at: row.get(8),
        counters: CampaignCounters {
            total_runs: row.get::<_, i32>(9) as u32,
            succeeded: row.get::<_, i32>(10) as u32,
            failed: row.get::<_, i32>(11) as u32,
            skipped: row.get::<_, i32>(12) as u32,
        },
        error: row.get(13),
    })
}

fn map_run_summary(row: &Row) -> RunSummary {
    RunSummary {
        id: row.get(0),
        model: row.get(1),
        engine: row.get(2),
        suite: row.get(3),
        timestamp: row.get(4),
        total: row.get(5),
        passed: row.get(6),
        failed: row.get(7),
        duration_seconds: row.get(8),
    }
}

impl Store for PostgresStore {
    fn migrate(&self) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version BIGINT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL
            )",
        )?;
        let current: i64 = client
            .query_one("SELECT COALESCE(MAX(version), 0) FROM schema_version", &[])?
            .get(0);
        for m in migrate::all().iter().filter(|m| m.version > current) {
            let mut tx = client.transaction()?;
            tx.batch_execute(m.postgres)
                .map_err(|e| StoreError::Migration {
                    version: m.version,
                    message: e.to_string(),
                })?;
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES ($1, $2)",
                &[&m.version, &Utc::now()],
            )?;
            tx.commit()?;
            tracing::info!(version = m.version, name = m.name, "applied migration");
        }
        Ok(())
    }

    fn schema_version(&self) -> Result<i64, StoreError> {
        let mut client = self.lock()?;
        Ok(client
            .query_one("SELECT COALESCE(MAX(version), 0) FROM schema_version", &[])?
            .get(0))
    }

    fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        let mut tx = client.transaction()?;
        tx.execute(
            "INSERT INTO runs (id, model, engine, suite, timestamp, total, passed, failed, \
             duration_seconds, raw_json) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::json)",
            &[
                &run.id,
                &run.model,
                &run.engine,
                &run.suite,
                &run.timestamp,
                &run.total,
                &run.passed,
                &run.failed,
                &run.duration_seconds,
                &run.raw_json,
            ],
        )?;
        for bench in &run.benchmarks {
            let bench_id: i64 = tx
                .query_one(
                    "INSERT INTO benchmarks (run_id, name, category) VALUES ($1, $2, $3) \
                     RETURNING id",
                    &[&run.id, &bench.name, &bench.category],
                )?
                .get(0);
            for metric in &bench.metrics {
                tx.execute(
                    "INSERT INTO metrics (benchmark_id, name, value) VALUES ($1, $2, $3)",
                    &[&bench_id, &metric.name, &metric.value],
                )?;
            }
        }
        if let Some(hw) = &run.hardware {
            tx.execute(
                "INSERT INTO hardware (run_id, gpu, cpu, ram_gb, compute_capability, \
                 environment_type, vram_gb) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &run.id,
                    &hw.gpu,
                    &hw.cpu,
                    &hw.ram_gb,
                    &hw.compute_capability,
                    &hw.environment_type,
                    &hw.vram_gb,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        let mut client = self.lock()?;
        let row = client.query_opt(
            "SELECT id, model, engine, suite, timestamp, total, passed, failed, \
             duration_seconds, raw_json::text FROM runs WHERE id = $1",
            &[&id],
        )?;
        let Some(row) = row else { return Ok(None) };
        let run_id: String = row.get(0);

        let bench_rows = client.query(
            "SELECT id, name, category FROM benchmarks WHERE run_id = $1 ORDER BY id",
            &[&run_id],
        )?;
        let mut benchmarks = Vec::with_capacity(bench_rows.len());
        for bench in &bench_rows {
            let bench_id: i64 = bench.get(0);
            let metric_rows = client.query(
                "SELECT name, value FROM metrics WHERE benchmark_id = $1 ORDER BY id",
                &[&bench_id],
            )?;
            benchmarks.push(BenchmarkRecord {
                name: bench.get(1),
                category: bench.get(2),
                metrics: metric_rows
                    .iter()
                    .map(|m| MetricRecord {
                        name: m.get(0),
                        value: m.get(1),
                    })
                    .collect(),
            });
        }

        let hardware = client
            .query_opt(
                "SELECT gpu, cpu, ram_gb, compute_capability, environment_type, vram_gb \
                 FROM hardware WHERE run_id = $1",
                &[&run_id],
            )?
            .map(|hw| HardwareInfo {
                gpu: hw.get(0),
                cpu: hw.get(1),
                ram_gb: hw.get(2),
                compute_capability: hw.get(3),
                environment_type: hw.get(4),
                vram_gb: hw.get(5),
            });

        Ok(Some(RunRecord {
            id: run_id,
            model: row.get(1),
            engine: row.get(2),
            suite: row.get(3),
            timestamp: row.get(4),
            total: row.get(5),
            passed: row.get(6),
            failed: row.get(7),
            duration_seconds: row.get(8),
            raw_json: row.get(9),
            benchmarks,
            hardware,
        }))
    }

    fn delete_run(&self, id: &str) -> Result<bool, StoreError> {
        let mut client = self.lock()?;
        let n = client.execute("DELETE FROM runs WHERE id = $1", &[&id])?;
        Ok(n > 0)
    }

    fn query_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let mut client = self.lock()?;
        let mut sql = String::from(
            "SELECT id, model, engine, suite, timestamp, total, passed, failed, \
             duration_seconds FROM runs WHERE TRUE",
        );
        let mut args: Vec<Box<dyn postgres::types::ToSql + Sync>> = Vec::new();
        if let Some(m) = &filter.model {
            args.push(Box::new(m.clone()));
            sql.push_str(&format!(" AND model = ${}", args.len()));
        }
        if let Some(e) = &filter.engine {
            args.push(Box::new(e.clone()));
            sql.push_str(&format!(" AND engine = ${}", args.len()));
        }
        if let Some(s) = &filter.suite {
            args.push(Box::new(s.clone()));
            sql.push_str(&format!(" AND suite = ${}", args.len()));
        }
        if let Some(since) = filter.since {
            args.push(Box::new(since));
            sql.push_str(&format!(" AND timestamp >= ${}", args.len()));
        }
        if let Some(until) = filter.until {
            args.push(Box::new(until));
            sql.push_str(&format!(" AND timestamp <= ${}", args.len()));
        }
        sql.push_str(" ORDER BY timestamp DESC");
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(100)));
        if let Some(offset) = filter.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        let arg_refs: Vec<&(dyn postgres::types::ToSql + Sync)> =
            args.iter().map(|a| a.as_ref()).collect();
        let rows = client.query(&sql, &arg_refs)?;
        Ok(rows.iter().map(map_run_summary).collect())
    }

    fn metric_values(
        &self,
        group_by: GroupBy,
        metric: &str,
    ) -> Result<Vec<(String, Option<f64>)>, StoreError> {
        let mut client = self.lock()?;
        let sql = format!(
            "SELECT r.{col}, m.value FROM metrics m \
             JOIN benchmarks b ON m.benchmark_id = b.id \
             JOIN runs r ON b.run_id = r.id \
             WHERE m.name = $1 ORDER BY r.{col}",
            col = group_by.column()
        );
        let rows = client.query(&sql, &[&metric])?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    fn upsert_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            &format!(
                "INSERT INTO agents ({AGENT_COLS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
                  $18, $19, $20, $21, $22) \
                 ON CONFLICT (id) DO UPDATE SET \
                 name = excluded.name, host = excluded.host, port = excluded.port, \
                 cpu_arch = excluded.cpu_arch, gpu = excluded.gpu, cpu = excluded.cpu, \
                 ram_gb = excluded.ram_gb, compute_capability = excluded.compute_capability, \
                 environment_type = excluded.environment_type, vram_gb = excluded.vram_gb, \
                 status = excluded.status, last_heartbeat = excluded.last_heartbeat, \
                 registered_at = excluded.registered_at, is_test_agent = excluded.is_test_agent, \
                 token_prefix = excluded.token_prefix, token_hash = excluded.token_hash, \
                 kitt_version = excluded.kitt_version, gpu_util = excluded.gpu_util, \
                 gpu_mem_gb = excluded.gpu_mem_gb, storage_free_gb = excluded.storage_free_gb, \
                 uptime_s = excluded.uptime_s"
            ),
            &[
                &agent.id,
                &agent.name,
                &agent.host,
                &(agent.port as i32),
                &agent.cpu_arch.as_str(),
                &agent.hardware.gpu,
                &agent.hardware.cpu,
                &agent.hardware.ram_gb,
                &agent.hardware.compute_capability,
                &agent.hardware.environment_type,
                &agent.hardware.vram_gb,
                &agent.status.as_str(),
                &agent.last_heartbeat,
                &agent.registered_at,
                &agent.is_test_agent,
                &agent.token_prefix,
                &agent.token_hash,
                &agent.kitt_version,
                &agent.telemetry.gpu_util,
                &agent.telemetry.gpu_mem_gb,
                &agent.telemetry.storage_free_gb,
                &agent.telemetry.uptime_s,
            ],
        )?;
        Ok(())
    }

    fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let mut client = self.lock()?;
        client
            .query_opt(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE id = $1"),
                &[&id],
            )?
            .map(|row| map_agent(&row))
            .transpose()
    }

    fn get_agent_by_name(&self, name: &str) -> Result<Option<AgentRecord>, StoreError> {
        let mut client = self.lock()?;
        client
            .query_opt(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE name = $1"),
                &[&name],
            )?
            .map(|row| map_agent(&row))
            .transpose()
    }

    fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let mut client = self.lock()?;
        let rows = client.query(
            &format!("SELECT {AGENT_COLS} FROM agents ORDER BY name"),
            &[],
        )?;
        rows.iter().map(map_agent).collect()
    }

    fn delete_agent(&self, id: &str) -> Result<bool, StoreError> {
        let mut client = self.lock()?;
        let n = client.execute("DELETE FROM agents WHERE id = $1", &[&id])?;
        Ok(n > 0)
    }

    fn record_heartbeat(&self, id: &str, beat: &HeartbeatTelemetry) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "UPDATE agents SET status = $2, last_heartbeat = $3, gpu_util = $4, \
             gpu_mem_gb = $5, storage_free_gb = $6, uptime_s = $7 WHERE id = $1",
            &[
                &id,
                &beat.status.as_str(),
                &beat.at,
                &beat.telemetry.gpu_util,
                &beat.telemetry.gpu_mem_gb,
                &beat.telemetry.storage_free_gb,
                &beat.telemetry.uptime_s,
            ],
        )?;
        Ok(())
    }

    fn set_agent_status(&self, id: &str, status: AgentStatus) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "UPDATE agents SET status = $2 WHERE id = $1",
            &[&id, &status.as_str()],
        )?;
        Ok(())
    }

    fn set_agent_token(&self, id: &str, prefix: &str, hash: &str) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "UPDATE agents SET token_prefix = $2, token_hash = $3 WHERE id = $1",
            &[&id, &prefix, &hash],
        )?;
        Ok(())
    }

    fn agent_settings(&self, agent_id: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let mut client = self.lock()?;
        let rows = client.query(
            "SELECT key, value FROM agent_settings WHERE agent_id = $1",
            &[&agent_id],
        )?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    fn put_agent_setting(
        &self,
        agent_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "INSERT INTO agent_settings (agent_id, key, value) VALUES ($1, $2, $3) \
             ON CONFLICT (agent_id, key) DO UPDATE SET value = excluded.value",
            &[&agent_id, &key, &value],
        )?;
        Ok(())
    }

    fn insert_quick_test(&self, test: &QuickTestRecord) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            &format!(
                "INSERT INTO quick_tests ({QT_COLS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
            ),
            &[
                &test.id,
                &test.agent_id,
                &test.campaign_id,
                &test.model,
                &test.engine,
                &test.suite,
                &test.force,
                &test.status.as_str(),
                &test.created_at,
                &test.started_at,
                &test.completed_at,
                &test.result_id,
                &test.error,
            ],
        )?;
        Ok(())
    }

    fn get_quick_test(&self, id: &str) -> Result<Option<QuickTestRecord>, StoreError> {
        let mut client = self.lock()?;
        client
            .query_opt(
                &format!("SELECT {QT_COLS} FROM quick_tests WHERE id = $1"),
                &[&id],
            )?
            .map(|row| map_quick_test(&row))
            .transpose()
    }

    fn list_quick_tests(
        &self,
        filter: &QuickTestFilter,
    ) -> Result<Vec<QuickTestRecord>, StoreError> {
        let mut client = self.lock()?;
        let mut sql = format!("SELECT {QT_COLS} FROM quick_tests WHERE TRUE");
        let mut args: Vec<Box<dyn postgres::types::ToSql + Sync>> = Vec::new();
        if let Some(agent) = &filter.agent_id {
            args.push(Box::new(agent.clone()));
            sql.push_str(&format!(" AND agent_id = ${}", args.len()));
        }
        if let Some(campaign) = &filter.campaign_id {
            args.push(Box::new(campaign.clone()));
            sql.push_str(&format!(" AND campaign_id = ${}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ${}", args.len()));
        }
        if filter.active {
            sql.push_str(" AND status IN ('dispatched', 'running')");
        }
        sql.push_str(" ORDER BY created_at ASC");
        let arg_refs: Vec<&(dyn postgres::types::ToSql + Sync)> =
            args.iter().map(|a| a.as_ref()).collect();
        let rows = client.query(&sql, &arg_refs)?;
        rows.iter().map(map_quick_test).collect()
    }

    fn set_quick_test_status(
        &self,
        id: &str,
        status: TestStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        let now = Utc::now();
        let started = (status == TestStatus::Running).then_some(now);
        let completed = status.is_terminal().then_some(now);
        client.execute(
            "UPDATE quick_tests SET status = $2, \
             error = COALESCE($3, error), \
             started_at = COALESCE(started_at, $4), \
             completed_at = COALESCE(completed_at, $5) \
             WHERE id = $1",
            &[&id, &status.as_str(), &error, &started, &completed],
        )?;
        Ok(())
    }

    fn link_result(&self, test_id: &str, run_id: &str) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "UPDATE quick_tests SET result_id = $2 WHERE id = $1",
            &[&test_id, &run_id],
        )?;
        Ok(())
    }

    fn append_quick_test_logs(
        &self,
        test_id: &str,
        lines: &[LogEntry],
    ) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        let mut tx = client.transaction()?;
        for entry in lines {
            tx.execute(
                "INSERT INTO quick_test_logs (test_id, ts, line) VALUES ($1, $2, $3)",
                &[&test_id, &entry.ts, &entry.line],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn quick_test_logs(&self, test_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let mut client = self.lock()?;
        let rows = client.query(
            "SELECT ts, line FROM quick_test_logs WHERE test_id = $1 ORDER BY id ASC",
            &[&test_id],
        )?;
        Ok(rows
            .iter()
            .map(|r| LogEntry {
                ts: r.get(0),
                line: r.get(1),
            })
            .collect())
    }

    fn insert_campaign(&self, campaign: &CampaignRecord) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            &format!(
                "INSERT INTO campaigns ({CAMPAIGN_COLS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
            ),
            &[
                &campaign.id,
                &campaign.name,
                &campaign.description,
                &campaign.config_yaml,
                &campaign.status.as_str(),
                &campaign.agent_id,
                &campaign.created_at,
                &campaign.started_at,
                &campaign.completed_at,
                &(campaign.counters.total_runs as i32),
                &(campaign.counters.succeeded as i32),
                &(campaign.counters.failed as i32),
                &(campaign.counters.skipped as i32),
                &campaign.error,
            ],
        )?;
        Ok(())
    }

    fn get_campaign(&self, id: &str) -> Result<Option<CampaignRecord>, StoreError> {
        let mut client = self.lock()?;
        client
            .query_opt(
                &format!("SELECT {CAMPAIGN_COLS} FROM campaigns WHERE id = $1"),
                &[&id],
            )?
            .map(|row| map_campaign(&row))
            .transpose()
    }

    fn list_campaigns(&self) -> Result<Vec<CampaignRecord>, StoreError> {
        let mut client = self.lock()?;
        let rows = client.query(
            &format!("SELECT {CAMPAIGN_COLS} FROM campaigns ORDER BY created_at DESC"),
            &[],
        )?;
        rows.iter().map(map_campaign).collect()
    }

    fn set_campaign_status(
        &self,
        id: &str,
        status: CampaignStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        let now = Utc::now();
        let started = (status == CampaignStatus::Running).then_some(now);
        let completed = status.is_terminal().then_some(now);
        client.execute(
            "UPDATE campaigns SET status = $2, \
             error = COALESCE($3, error), \
             started_at = COALESCE(started_at, $4), \
             completed_at = COALESCE(completed_at, $5) \
             WHERE id = $1",
            &[&id, &status.as_str(), &error, &started, &completed],
        )?;
        Ok(())
    }

    fn set_campaign_agent(&self, id: &str, agent_id: &str) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "UPDATE campaigns SET agent_id = $2 WHERE id = $1",
            &[&id, &agent_id],
        )?;
        Ok(())
    }

    fn update_campaign_config(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        config_yaml: &str,
    ) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "UPDATE campaigns SET name = $2, description = $3, config_yaml = $4 WHERE id = $1",
            &[&id, &name, &description, &config_yaml],
        )?;
        Ok(())
    }

    fn update_campaign_counters(
        &self,
        id: &str,
        counters: &CampaignCounters,
    ) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "UPDATE campaigns SET total_runs = $2, succeeded = $3, failed = $4, skipped = $5 \
             WHERE id = $1",
            &[
                &id,
                &(counters.total_runs as i32),
                &(counters.succeeded as i32),
                &(counters.failed as i32),
                &(counters.skipped as i32),
            ],
        )?;
        Ok(())
    }

    fn append_campaign_log(&self, campaign_id: &str, entry: &LogEntry) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "INSERT INTO campaign_logs (campaign_id, ts, line) VALUES ($1, $2, $3)",
            &[&campaign_id, &entry.ts, &entry.line],
        )?;
        Ok(())
    }

    fn campaign_logs(&self, campaign_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let mut client = self.lock()?;
        let rows = client.query(
            "SELECT ts, line FROM campaign_logs WHERE campaign_id = $1 ORDER BY id ASC",
            &[&campaign_id],
        )?;
        Ok(rows
            .iter()
            .map(|r| LogEntry {
                ts: r.get(0),
                line: r.get(1),
            })
            .collect())
    }

    fn append_event(
        &self,
        event_type: &str,
        source: &str,
        payload_json: &str,
    ) -> Result<u64, StoreError> {
        let mut client = self.lock()?;
        let seq: i64 = client
            .query_one(
                "INSERT INTO events (type, source_id, payload_json, created_at) \
                 VALUES ($1, $2, $3::json, $4) RETURNING seq_id",
                &[&event_type, &source, &payload_json, &Utc::now()],
            )?
            .get(0);
        Ok(seq as u64)
    }

    fn events_after(
        &self,
        seq: u64,
        source: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut client = self.lock()?;
        let rows = match source {
            Some(src) => client.query(
                "SELECT seq_id, type, source_id, payload_json::text, created_at FROM events \
                 WHERE seq_id > $1 AND source_id = $2 ORDER BY seq_id ASC LIMIT $3",
                &[&(seq as i64), &src, &(limit as i64)],
            )?,
            None => client.query(
                "SELECT seq_id, type, source_id, payload_json::text, created_at FROM events \
                 WHERE seq_id > $1 ORDER BY seq_id ASC LIMIT $2",
                &[&(seq as i64), &(limit as i64)],
            )?,
        };
        Ok(rows
            .iter()
            .map(|r| EventRecord {
                seq: r.get::<_, i64>(0) as u64,
                event_type: r.get(1),
                source: r.get(2),
                payload_json: r.get(3),
                created_at: r.get(4),
            })
            .collect())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut client = self.lock()?;
        Ok(client
            .query_opt("SELECT value FROM settings WHERE key = $1", &[&key])?
            .map(|r| r.get(0)))
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut client = self.lock()?;
        client.execute(
            "INSERT INTO settings (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            &[&key, &value],
        )?;
        Ok(())
    }
}
