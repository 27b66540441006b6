//! Embedded file-database driver.
//!
//! Writes serialize through one process-wide lock around a persistent
//! connection; reads open short-lived read-only connections so they run
//! concurrently under WAL.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use stream_event::{CpuArch, HardwareInfo};

use super::migrate;
use super::{
    AgentRecord, AgentTelemetry, BenchmarkRecord, CampaignCounters, CampaignRecord, EventRecord,
    GroupBy, HeartbeatTelemetry, LogEntry, MetricRecord, QuickTestFilter, QuickTestRecord,
    RunFilter, RunRecord, RunSummary, Store, StoreError,
};
use crate::types::{AgentStatus, CampaignStatus, TestStatus};

pub struct SqliteStore {
    path: PathBuf,
    write: Mutex<Connection>,
}

fn ts_text(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

fn opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_ts).transpose()
}

/// Wraps a domain parse failure so it can travel through a `query_map` closure.
fn row_err(e: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            e.to_string(),
        )),
    )
}

fn configure(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5_000)?;
    Ok(())
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`. Call [`Store::migrate`]
    /// before first use.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("create {parent:?}: {e}")))?;
            }
        }
        let conn = Connection::open(&path)?;
        configure(&conn)?;
        Ok(Self {
            path,
            write: Mutex::new(conn),
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.write.lock().map_err(|_| StoreError::Lock)
    }

    fn reader(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(conn)
    }
}

const AGENT_COLS: &str = "id, name, host, port, cpu_arch, gpu, cpu, ram_gb, compute_capability, \
     environment_type, vram_gb, status, last_heartbeat, registered_at, is_test_agent, \
     token_prefix, token_hash, kitt_version, gpu_util, gpu_mem_gb, storage_free_gb, uptime_s";

fn map_agent(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    let cpu_arch: String = row.get(4)?;
    let status: String = row.get(11)?;
    let last_heartbeat: Option<String> = row.get(12)?;
    let registered_at: String = row.get(13)?;
    Ok(AgentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get::<_, i64>(3)? as u16,
        cpu_arch: match cpu_arch.as_str() {
            "amd64" => CpuArch::Amd64,
            "arm64" => CpuArch::Arm64,
            other => return Err(row_err(format!("cpu_arch {other:?}"))),
        },
        hardware: HardwareInfo {
            gpu: row.get(5)?,
            cpu: row.get(6)?,
            ram_gb: row.get(7)?,
            compute_capability: row.get(8)?,
            environment_type: row.get(9)?,
            vram_gb: row.get(10)?,
        },
        status: status.parse::<AgentStatus>().map_err(row_err)?,
        last_heartbeat: opt_ts(last_heartbeat).map_err(row_err)?,
        registered_at: parse_ts(&registered_at).map_err(row_err)?,
        is_test_agent: row.get::<_, i64>(14)? != 0,
        token_prefix: row.get(15)?,
        token_hash: row.get(16)?,
        kitt_version: row.get(17)?,
        telemetry: AgentTelemetry {
            gpu_util: row.get(18)?,
            gpu_mem_gb: row.get(19)?,
            storage_free_gb: row.get(20)?,
            uptime_s: row.get(21)?,
        },
    })
}

const QT_COLS: &str = "id, agent_id, campaign_id, model, engine, suite, force_dispatch, status, \
     created_at, started_at, completed_at, result_id, error";

fn map_quick_test(row: &Row<'_>) -> rusqlite::Result<QuickTestRecord> {
    let status: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let started_at: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;
    Ok(QuickTestRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        campaign_id: row.get(2)?,
        model: row.get(3)?,
        engine: row.get(4)?,
        suite: row.get(5)?,
        force: row.get::<_, i64>(6)? != 0,
        status: status.parse::<TestStatus>().map_err(row_err)?,
        created_at: parse_ts(&created_at).map_err(row_err)?,
        started_at: opt_ts(started_at).map_err(row_err)?,
        completed_at: opt_ts(completed_at).map_err(row_err)?,
        result_id: row.get(11)?,
        error: row.get(12)?,
    })
}

const CAMPAIGN_COLS: &str = "id, name, description, config_yaml, status, agent_id, created_at, \
     started_at, completed_at, total_runs, succeeded, failed, skipped, error";

fn map_campaign(row: &Row<'_>) -> rusqlite::Result<CampaignRecord> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let started_at: Option<String> = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;
    Ok(CampaignRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        config_yaml: row.get(3)?,
        status: status.parse::<CampaignStatus>().map_err(row_err)?,
        agent_id: row.get(5)?,
        created_at: parse_ts(&created_at).map_err(row_err)?,
        started_at: opt_ts(started_at).map_err(row_err)?,
        completed_at: opt_ts(completed_at).map_err(row_err)?,
        counters: CampaignCounters {
            total_runs: row.get::<_, i64>(9)? as u32,
            succeeded: row.get::<_, i64>(10)? as u32,
            failed: row.get::<_, i64>(11)? as u32,
            skipped: row.get::<_, i64>(12)? as u32,
        },
        error: row.get(13)?,
    })
}

fn map_run_summary(row: &Row<'_>) -> rusqlite::Result<RunSummary> {
    let timestamp: String = row.get(4)?;
    Ok(RunSummary {
        id: row.get(0)?,
        model: row.get(1)?,
        engine: row.get(2)?,
        suite: row.get(3)?,
        timestamp: parse_ts(&timestamp).map_err(row_err)?,
        total: row.get(5)?,
        passed: row.get(6)?,
        failed: row.get(7)?,
        duration_seconds: row.get(8)?,
    })
}

fn map_log(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let ts: String = row.get(0)?;
    Ok(LogEntry {
        ts: parse_ts(&ts).map_err(row_err)?,
        line: row.get(1)?,
    })
}

impl Store for SqliteStore {
    fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.writer()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;
        let current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| {
                r.get(0)
            })?;
        for m in migrate::all().iter().filter(|m| m.version > current) {
            let tx = conn.transaction()?;
            tx.execute_batch(m.sqlite)
                .map_err(|e| StoreError::Migration {
                    version: m.version,
                    message: e.to_string(),
                })?;
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![m.version, ts_text(Utc::now())],
            )?;
            tx.commit()?;
            tracing::info!(version = m.version, name = m.name, "applied migration");
        }
        Ok(())
    }

    fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.reader()?;
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )?)
    }

    fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO runs (id, model, engine, suite, timestamp, total, passed, failed, \
             duration_seconds, raw_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.id,
                run.model,
                run.engine,
                run.suite,
                ts_text(run.timestamp),
                run.total,
                run.passed,
                run.failed,
                run.duration_seconds,
                run.raw_json,
            ],
        )?;
        for bench in &run.benchmarks {
            tx.execute(
                "INSERT INTO benchmarks (run_id, name, category) VALUES (?1, ?2, ?3)",
                params![run.id, bench.name, bench.category],
            )?;
            let bench_id = tx.last_insert_rowid();
            for metric in &bench.metrics {
                tx.execute(
                    "INSERT INTO metrics (benchmark_id, name, value) VALUES (?1, ?2, ?3)",
                    params![bench_id, metric.name, metric.value],
                )?;
            }
        }
        if let Some(hw) = &run.hardware {
            tx.execute(
                "INSERT INTO hardware (run_id, gpu, cpu, ram_gb, compute_capability, \
                 environment_type, vram_gb) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.id,
                    hw.gpu,
                    hw.cpu,
                    hw.ram_gb,
                    hw.compute_capability,
                    hw.environment_type,
                    hw.vram_gb,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.reader()?;
        let base = conn
            .query_row(
                "SELECT id, model, engine, suite, timestamp, total, passed, failed, \
                 duration_seconds, raw_json FROM runs WHERE id = ?1",
                params![id],
                |row| {
                    let timestamp: String = row.get(4)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        timestamp,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, f64>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, model, engine, suite, ts, total, passed, failed, duration, raw_json)) = base
        else {
            return Ok(None);
        };

        let mut benchmarks = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, name, category FROM benchmarks WHERE run_id = ?1 ORDER BY id",
            )?;
            let bench_rows: Vec<(i64, String, Option<String>)> = stmt
                .query_map(params![id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<_, _>>()?;
            let mut metric_stmt = conn.prepare(
                "SELECT name, value FROM metrics WHERE benchmark_id = ?1 ORDER BY id",
            )?;
            for (bench_id, name, category) in bench_rows {
                let metrics: Vec<MetricRecord> = metric_stmt
                    .query_map(params![bench_id], |row| {
                        Ok(MetricRecord {
                            name: row.get(0)?,
                            value: row.get(1)?,
                        })
                    })?
                    .collect::<Result<_, _>>()?;
                benchmarks.push(BenchmarkRecord {
                    name,
                    category,
                    metrics,
                });
            }
        }

        let hardware = conn
            .query_row(
                "SELECT gpu, cpu, ram_gb, compute_capability, environment_type, vram_gb \
                 FROM hardware WHERE run_id = ?1",
                params![id],
                |row| {
                    Ok(HardwareInfo {
                        gpu: row.get(0)?,
                        cpu: row.get(1)?,
                        ram_gb: row.get(2)?,
                        compute_capability: row.get(3)?,
                        environment_type: row.get(4)?,
                        vram_gb: row.get(5)?,
                    })
                },
            )
            .optional()?;

        Ok(Some(RunRecord {
            id,
            model,
            engine,
            suite,
            timestamp: parse_ts(&ts)?,
            total,
            passed,
            failed,
            duration_seconds: duration,
            raw_json,
            benchmarks,
            hardware,
        }))
    }

    fn delete_run(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.writer()?;
        let n = conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    fn query_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let conn = self.reader()?;
        let mut sql = String::from(
            "SELECT id, model, engine, suite, timestamp, total, passed, failed, \
             duration_seconds FROM runs WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(m) = &filter.model {
            sql.push_str(&format!(" AND model = ?{}", args.len() + 1));
            args.push(Box::new(m.clone()));
        }
        if let Some(e) = &filter.engine {
            sql.push_str(&format!(" AND engine = ?{}", args.len() + 1));
            args.push(Box::new(e.clone()));
        }
        if let Some(s) = &filter.suite {
            sql.push_str(&format!(" AND suite = ?{}", args.len() + 1));
            args.push(Box::new(s.clone()));
        }
        if let Some(since) = filter.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len() + 1));
            args.push(Box::new(ts_text(since)));
        }
        if let Some(until) = filter.until {
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len() + 1));
            args.push(Box::new(ts_text(until)));
        }
        sql.push_str(" ORDER BY timestamp DESC");
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(100)));
        if let Some(offset) = filter.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&arg_refs[..], map_run_summary)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn metric_values(
        &self,
        group_by: GroupBy,
        metric: &str,
    ) -> Result<Vec<(String, Option<f64>)>, StoreError> {
        let conn = self.reader()?;
        let sql = format!(
            "SELECT r.{col}, m.value FROM metrics m \
             JOIN benchmarks b ON m.benchmark_id = b.id \
             JOIN runs r ON b.run_id = r.id \
             WHERE m.name = ?1 ORDER BY r.{col}",
            col = group_by.column()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![metric], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn upsert_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO agents ({AGENT_COLS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                  ?18, ?19, ?20, ?21, ?22)"
            ),
            params![
                agent.id,
                agent.name,
                agent.host,
                agent.port as i64,
                agent.cpu_arch.as_str(),
                agent.hardware.gpu,
                agent.hardware.cpu,
                agent.hardware.ram_gb,
                agent.hardware.compute_capability,
                agent.hardware.environment_type,
                agent.hardware.vram_gb,
                agent.status.as_str(),
                agent.last_heartbeat.map(ts_text),
                ts_text(agent.registered_at),
                agent.is_test_agent as i64,
                agent.token_prefix,
                agent.token_hash,
                agent.kitt_version,
                agent.telemetry.gpu_util,
                agent.telemetry.gpu_mem_gb,
                agent.telemetry.storage_free_gb,
                agent.telemetry.uptime_s,
            ],
        )?;
        Ok(())
    }

    fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let conn = self.reader()?;
        Ok(conn
            .query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
                params![id],
                map_agent,
            )
            .optional()?)
    }

    fn get_agent_by_name(&self, name: &str) -> Result<Option<AgentRecord>, StoreError> {
        let conn = self.reader()?;
        Ok(conn
            .query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE name = ?1"),
                params![name],
                map_agent,
            )
            .optional()?)
    }

    fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let conn = self.reader()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {AGENT_COLS} FROM agents ORDER BY name"))?;
        let rows = stmt.query_map([], map_agent)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn delete_agent(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.writer()?;
        let n = conn.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    fn record_heartbeat(&self, id: &str, beat: &HeartbeatTelemetry) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE agents SET status = ?2, last_heartbeat = ?3, gpu_util = ?4, \
             gpu_mem_gb = ?5, storage_free_gb = ?6, uptime_s = ?7 WHERE id = ?1",
            params![
                id,
                beat.status.as_str(),
                ts_text(beat.at),
                beat.telemetry.gpu_util,
                beat.telemetry.gpu_mem_gb,
                beat.telemetry.storage_free_gb,
                beat.telemetry.uptime_s,
            ],
        )?;
        Ok(())
    }

    fn set_agent_status(&self, id: &str, status: AgentStatus) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE agents SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    fn set_agent_token(&self, id: &str, prefix: &str, hash: &str) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE agents SET token_prefix = ?2, token_hash = ?3 WHERE id = ?1",
            params![id, prefix, hash],
        )?;
        Ok(())
    }

    fn agent_settings(&self, agent_id: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let conn = self.reader()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM agent_settings WHERE agent_id = ?1")?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    fn put_agent_setting(
        &self,
        agent_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO agent_settings (agent_id, key, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(agent_id, key) DO UPDATE SET value = excluded.value",
            params![agent_id, key, value],
        )?;
        Ok(())
    }

    fn insert_quick_test(&self, test: &QuickTestRecord) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            &format!(
                "INSERT INTO quick_tests ({QT_COLS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                test.id,
                test.agent_id,
                test.campaign_id,
                test.model,
                test.engine,
                test.suite,
                test.force as i64,
                test.status.as_str(),
                ts_text(test.created_at),
                test.started_at.map(ts_text),
                test.completed_at.map(ts_text),
                test.result_id,
                test.error,
            ],
        )?;
        Ok(())
    }

    fn get_quick_test(&self, id: &str) -> Result<Option<QuickTestRecord>, StoreError> {
        let conn = self.reader()?;
        Ok(conn
            .query_row(
                &format!("SELECT {QT_COLS} FROM quick_tests WHERE id = ?1"),
                params![id],
                map_quick_test,
            )
            .optional()?)
    }

    fn list_quick_tests(
        &self,
        filter: &QuickTestFilter,
    ) -> Result<Vec<QuickTestRecord>, StoreError> {
        let conn = self.reader()?;
        let mut sql = format!("SELECT {QT_COLS} FROM quick_tests WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(agent) = &filter.agent_id {
            sql.push_str(&format!(" AND agent_id = ?{}", args.len() + 1));
            args.push(Box::new(agent.clone()));
        }
        if let Some(campaign) = &filter.campaign_id {
            sql.push_str(&format!(" AND campaign_id = ?{}", args.len() + 1));
            args.push(Box::new(campaign.clone()));
        }
        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        if filter.active {
            sql.push_str(" AND status IN ('dispatched', 'running')");
        }
        sql.push_str(" ORDER BY created_at ASC");
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&arg_refs[..], map_quick_test)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn set_quick_test_status(
        &self,
        id: &str,
        status: TestStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.writer()?;
        let now = ts_text(Utc::now());
        let started = (status == TestStatus::Running).then_some(now.as_str());
        let completed = status.is_terminal().then_some(now.as_str());
        conn.execute(
            "UPDATE quick_tests SET status = ?2, \
             error = COALESCE(?3, error), \
             started_at = COALESCE(started_at, ?4), \
             completed_at = COALESCE(completed_at, ?5) \
             WHERE id = ?1",
            params![id, status.as_str(), error, started, completed],
        )?;
        Ok(())
    }

    fn link_result(&self, test_id: &str, run_id: &str) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE quick_tests SET result_id = ?2 WHERE id = ?1",
            params![test_id, run_id],
        )?;
        Ok(())
    }

    fn append_quick_test_logs(
        &self,
        test_id: &str,
        lines: &[LogEntry],
    ) -> Result<(), StoreError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO quick_test_logs (test_id, ts, line) VALUES (?1, ?2, ?3)",
            )?;
            for entry in lines {
                stmt.execute(params![test_id, ts_text(entry.ts), entry.line])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn quick_test_logs(&self, test_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT ts, line FROM quick_test_logs WHERE test_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![test_id], map_log)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn insert_campaign(&self, campaign: &CampaignRecord) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            &format!(
                "INSERT INTO campaigns ({CAMPAIGN_COLS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                campaign.id,
                campaign.name,
                campaign.description,
                campaign.config_yaml,
                campaign.status.as_str(),
                campaign.agent_id,
                ts_text(campaign.created_at),
                campaign.started_at.map(ts_text),
                campaign.completed_at.map(ts_text),
                campaign.counters.total_runs as i64,
                campaign.counters.succeeded as i64,
                campaign.counters.failed as i64,
                campaign.counters.skipped as i64,
                campaign.error,
            ],
        )?;
        Ok(())
    }

    fn get_campaign(&self, id: &str) -> Result<Option<CampaignRecord>, StoreError> {
        let conn = self.reader()?;
        Ok(conn
            .query_row(
                &format!("SELECT {CAMPAIGN_COLS} FROM campaigns WHERE id = ?1"),
                params![id],
                map_campaign,
            )
            .optional()?)
    }

    fn list_campaigns(&self) -> Result<Vec<CampaignRecord>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CAMPAIGN_COLS} FROM campaigns ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], map_campaign)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn set_campaign_status(
        &self,
        id: &str,
        status: CampaignStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.writer()?;
        let now = ts_text(Utc::now());
        let started = (status == CampaignStatus::Running).then_some(now.as_str());
        let completed = status.is_terminal().then_some(now.as_str());
        conn.execute(
            "UPDATE campaigns SET status = ?2, \
             error = COALESCE(?3, error), \
             started_at = COALESCE(started_at, ?4), \
             completed_at = COALESCE(completed_at, ?5) \
             WHERE id = ?1",
            params![id, status.as_str(), error, started, completed],
        )?;
        Ok(())
    }

    fn set_campaign_agent(&self, id: &str, agent_id: &str) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE campaigns SET agent_id = ?2 WHERE id = ?1",
            params![id, agent_id],
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
        let conn = self.writer()?;
        conn.execute(
            "UPDATE campaigns SET name = ?2, description = ?3, config_yaml = ?4 WHERE id = ?1",
            params![id, name, description, config_yaml],
        )?;
        Ok(())
    }

    fn update_campaign_counters(
        &self,
        id: &str,
        counters: &CampaignCounters,
    ) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE campaigns SET total_runs = ?2, succeeded = ?3, failed = ?4, skipped = ?5 \
             WHERE id = ?1",
            params![
                id,
                counters.total_runs as i64,
                counters.succeeded as i64,
                counters.failed as i64,
                counters.skipped as i64,
            ],
        )?;
        Ok(())
    }

    fn append_campaign_log(&self, campaign_id: &str, entry: &LogEntry) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO campaign_logs (campaign_id, ts, line) VALUES (?1, ?2, ?3)",
            params![campaign_id, ts_text(entry.ts), entry.line],
        )?;
        Ok(())
    }

    fn campaign_logs(&self, campaign_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT ts, line FROM campaign_logs WHERE campaign_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![campaign_id], map_log)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn append_event(
        &self,
        event_type: &str,
        source: &str,
        payload_json: &str,
    ) -> Result<u64, StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO events (type, source_id, payload_json, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![event_type, source, payload_json, ts_text(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn events_after(
        &self,
        seq: u64,
        source: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let conn = self.reader()?;
        let (sql, args): (String, Vec<Box<dyn rusqlite::ToSql>>) = match source {
            Some(src) => (
                "SELECT seq_id, type, source_id, payload_json, created_at FROM events \
                 WHERE seq_id > ?1 AND source_id = ?2 ORDER BY seq_id ASC LIMIT ?3"
                    .to_string(),
                vec![
                    Box::new(seq as i64),
                    Box::new(src.to_string()),
                    Box::new(limit as i64),
                ],
            ),
            None => (
                "SELECT seq_id, type, source_id, payload_json, created_at FROM events \
                 WHERE seq_id > ?1 ORDER BY seq_id ASC LIMIT ?2"
                    .to_string(),
                vec![Box::new(seq as i64), Box::new(limit as i64)],
            ),
        };
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&arg_refs[..], |row| {
            let created_at: String = row.get(4)?;
            Ok(EventRecord {
                seq: row.get::<_, i64>(0)? as u64,
                event_type: row.get(1)?,
                source: row.get(2)?,
                payload_json: row.get(3)?,
                created_at: parse_ts(&created_at).map_err(row_err)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.reader()?;
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::run_from_metrics;

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("kitt.db")).unwrap();
        store.migrate().unwrap();
        (dir, store)
    }

    #[test]
    fn migrate_is_idempotent_and_versioned() {
        let (_dir, store) = open_store();
        let v = store.schema_version().unwrap();
        assert_eq!(v, migrate::all().last().unwrap().version);
        store.migrate().unwrap();
        assert_eq!(store.schema_version().unwrap(), v);
    }

    #[test]
    fn run_round_trip_preserves_raw_json() {
        let (_dir, store) = open_store();
        let blob = serde_json::json!({
            "throughput_tps": 125.0,
            "total": 3, "passed": 3, "failed": 0,
            "duration_seconds": 100.5,
            "benchmarks": [
                {"name": "gen", "category": "throughput", "metrics": {"tps": 125.0}}
            ]
        });
        let run = run_from_metrics(
            "run-1",
            "llama-7b-q4_k_m.gguf",
            "llama_cpp",
            "smoke",
            Utc::now(),
            &blob,
            Some(HardwareInfo {
                gpu: "RTX 4090".into(),
                cpu: "EPYC".into(),
                ram_gb: 128.0,
                compute_capability: Some("8.9".into()),
                environment_type: "baremetal".into(),
                vram_gb: Some(24.0),
            }),
        )
        .unwrap();
        store.save_run(&run).unwrap();

        let loaded = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(loaded.raw_json, run.raw_json);
        assert_eq!(loaded.benchmarks.len(), 1);
        assert_eq!(loaded.hardware.as_ref().unwrap().gpu, "RTX 4090");
        let reparsed: serde_json::Value = serde_json::from_str(&loaded.raw_json).unwrap();
        assert_eq!(reparsed, blob);

        assert!(store.delete_run("run-1").unwrap());
        assert!(store.get_run("run-1").unwrap().is_none());
        assert!(!store.delete_run("run-1").unwrap());
    }

    #[test]
    fn query_runs_filters_by_engine() {
        let (_dir, store) = open_store();
        for (id, engine) in [("a", "vllm"), ("b", "llama_cpp"), ("c", "vllm")] {
            let run = run_from_metrics(
                id,
                "m",
                engine,
                "s",
                Utc::now(),
                &serde_json::json!({"tps": 1.0}),
                None,
            )
            .unwrap();
            store.save_run(&run).unwrap();
        }
        let hits = store
            .query_runs(&RunFilter {
                engine: Some("vllm".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn aggregate_group_by_engine() {
        let (_dir, store) = open_store();
        for (id, engine, tps) in [("a", "vllm", 100.0), ("b", "vllm", 120.0), ("c", "tgi", 80.0)]
        {
            let run = run_from_metrics(
                id,
                "m",
                engine,
                "s",
                Utc::now(),
                &serde_json::json!({ "throughput_tps": tps }),
                None,
            )
            .unwrap();
            store.save_run(&run).unwrap();
        }
        let rows = store.aggregate(GroupBy::Engine, "throughput_tps").unwrap();
        assert_eq!(rows.len(), 2);
        let vllm = rows.iter().find(|r| r.group == "vllm").unwrap();
        assert_eq!(vllm.count, 2);
        assert!((vllm.mean - 110.0).abs() < 1e-9);
    }

    #[test]
    fn quick_test_status_stamps_timestamps() {
        let (_dir, store) = open_store();
        let qt = QuickTestRecord {
            id: "qt-1".into(),
            agent_id: "a-1".into(),
            campaign_id: None,
            model: "m".into(),
            engine: "e".into(),
            suite: "s".into(),
            force: false,
            status: TestStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result_id: None,
            error: None,
        };
        store.insert_quick_test(&qt).unwrap();
        store
            .set_quick_test_status("qt-1", TestStatus::Dispatched, None)
            .unwrap();
        let t = store.get_quick_test("qt-1").unwrap().unwrap();
        assert!(t.started_at.is_none());
        store
            .set_quick_test_status("qt-1", TestStatus::Running, None)
            .unwrap();
        let t = store.get_quick_test("qt-1").unwrap().unwrap();
        assert!(t.started_at.is_some());
        assert!(t.completed_at.is_none());
        store
            .set_quick_test_status("qt-1", TestStatus::Failed, Some("timeout"))
            .unwrap();
        let t = store.get_quick_test("qt-1").unwrap().unwrap();
        assert!(t.completed_at.is_some());
        assert_eq!(t.error.as_deref(), Some("timeout"));
        assert_eq!(t.status, TestStatus::Failed);
    }

    #[test]
    fn events_are_sequential_per_source() {
        let (_dir, store) = open_store();
        let s1 = store.append_event("log", "quicktest:1", "{}").unwrap();
        let s2 = store.append_event("log", "quicktest:1", "{}").unwrap();
        let s3 = store.append_event("log", "campaign:1", "{}").unwrap();
        assert!(s1 < s2 && s2 < s3);
        let only_qt = store.events_after(0, Some("quicktest:1"), 100).unwrap();
        assert_eq!(only_qt.len(), 2);
        let all = store.events_after(s1, None, 100).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn process_settings_round_trip() {
        let (_dir, store) = open_store();
        assert!(store.get_setting("default_agent").unwrap().is_none());
        store.put_setting("default_agent", "nodeA").unwrap();
        store.put_setting("default_agent", "nodeB").unwrap();
        assert_eq!(
            store.get_setting("default_agent").unwrap().as_deref(),
            Some("nodeB")
        );
    }

    #[test]
    fn agent_settings_upsert() {
        let (_dir, store) = open_store();
        let agent = test_agent("ag-1", "nodeA");
        store.upsert_agent(&agent).unwrap();
        store
            .put_agent_setting("ag-1", "heartbeat_interval_s", "30")
            .unwrap();
        store
            .put_agent_setting("ag-1", "heartbeat_interval_s", "60")
            .unwrap();
        let settings = store.agent_settings("ag-1").unwrap();
        assert_eq!(settings.get("heartbeat_interval_s").unwrap(), "60");
    }

    fn test_agent(id: &str, name: &str) -> AgentRecord {
        AgentRecord {
            id: id.into(),
            name: name.into(),
            host: "127.0.0.1".into(),
            port: 9101,
            cpu_arch: CpuArch::Amd64,
            hardware: HardwareInfo {
                gpu: "none".into(),
                cpu: "test".into(),
                ram_gb: 8.0,
                compute_capability: None,
                environment_type: "test".into(),
                vram_gb: None,
            },
            status: AgentStatus::Online,
            last_heartbeat: None,
            registered_at: Utc::now(),
            is_test_agent: true,
            token_prefix: "deadbeef".into(),
            token_hash: "0".repeat(64),
            kitt_version: "0.2.0".into(),
            telemetry: AgentTelemetry::default(),
        }
    }
}
