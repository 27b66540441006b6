//! Forward-only schema migrations, shared by both drivers.
//!
//! Each step carries its SQL per dialect; the type mapping between dialects:
//! timestamps are ISO-8601 TEXT / TIMESTAMPTZ, JSON is TEXT / JSON, booleans
//! are 0/1 INTEGER / BOOLEAN, floats are REAL / DOUBLE PRECISION.

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sqlite: &'static str,
    pub postgres: &'static str,
}

/// All migrations, ascending. Never reorder or edit a shipped entry; append.
pub fn all() -> &'static [Migration] {
    MIGRATIONS
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "runs",
        sqlite: r#"
            CREATE TABLE runs (
                id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                engine TEXT NOT NULL,
                suite TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                passed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                duration_seconds REAL NOT NULL DEFAULT 0,
                raw_json TEXT NOT NULL
            );
            CREATE TABLE benchmarks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                category TEXT
            );
            CREATE TABLE metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                benchmark_id INTEGER NOT NULL REFERENCES benchmarks(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                value REAL
            );
            CREATE TABLE hardware (
                run_id TEXT PRIMARY KEY REFERENCES runs(id) ON DELETE CASCADE,
                gpu TEXT NOT NULL,
                cpu TEXT NOT NULL,
                ram_gb REAL NOT NULL,
                compute_capability TEXT,
                environment_type TEXT NOT NULL,
                vram_gb REAL
            );
            CREATE INDEX idx_runs_model ON runs(model);
            CREATE INDEX idx_runs_engine ON runs(engine);
            CREATE INDEX idx_benchmarks_run ON benchmarks(run_id);
            CREATE INDEX idx_metrics_benchmark ON metrics(benchmark_id);
        "#,
        postgres: r#"
            CREATE TABLE runs (
                id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                engine TEXT NOT NULL,
                suite TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                total BIGINT NOT NULL DEFAULT 0,
                passed BIGINT NOT NULL DEFAULT 0,
                failed BIGINT NOT NULL DEFAULT 0,
                duration_seconds DOUBLE PRECISION NOT NULL DEFAULT 0,
                raw_json JSON NOT NULL
            );
            CREATE TABLE benchmarks (
                id BIGSERIAL PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                category TEXT
            );
            CREATE TABLE metrics (
                id BIGSERIAL PRIMARY KEY,
                benchmark_id BIGINT NOT NULL REFERENCES benchmarks(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                value DOUBLE PRECISION
            );
            CREATE TABLE hardware (
                run_id TEXT PRIMARY KEY REFERENCES runs(id) ON DELETE CASCADE,
                gpu TEXT NOT NULL,
                cpu TEXT NOT NULL,
                ram_gb DOUBLE PRECISION NOT NULL,
                compute_capability TEXT,
                environment_type TEXT NOT NULL,
                vram_gb DOUBLE PRECISION
            );
            CREATE INDEX idx_runs_model ON runs(model);
            CREATE INDEX idx_runs_engine ON runs(engine);
            CREATE INDEX idx_benchmarks_run ON benchmarks(run_id);
            CREATE INDEX idx_metrics_benchmark ON metrics(benchmark_id);
        "#,
    },
    Migration {
        version: 2,
        name: "agents",
        sqlite: r#"
            CREATE TABLE agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                cpu_arch TEXT NOT NULL,
                gpu TEXT NOT NULL,
                cpu TEXT NOT NULL,
                ram_gb REAL NOT NULL,
                compute_capability TEXT,
                environment_type TEXT NOT NULL,
                vram_gb REAL,
                status TEXT NOT NULL,
                last_heartbeat TEXT,
                registered_at TEXT NOT NULL,
                is_test_agent INTEGER NOT NULL DEFAULT 0,
                token_prefix TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                kitt_version TEXT NOT NULL DEFAULT '',
                gpu_util REAL NOT NULL DEFAULT 0,
                gpu_mem_gb REAL NOT NULL DEFAULT 0,
                storage_free_gb REAL NOT NULL DEFAULT 0,
                uptime_s INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE agent_settings (
                agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (agent_id, key)
            );
        "#,
        postgres: r#"
            CREATE TABLE agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                cpu_arch TEXT NOT NULL,
                gpu TEXT NOT NULL,
                cpu TEXT NOT NULL,
                ram_gb DOUBLE PRECISION NOT NULL,
                compute_capability TEXT,
                environment_type TEXT NOT NULL,
                vram_gb DOUBLE PRECISION,
                status TEXT NOT NULL,
                last_heartbeat TIMESTAMPTZ,
                registered_at TIMESTAMPTZ NOT NULL,
                is_test_agent BOOLEAN NOT NULL DEFAULT FALSE,
                token_prefix TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                kitt_version TEXT NOT NULL DEFAULT '',
                gpu_util DOUBLE PRECISION NOT NULL DEFAULT 0,
                gpu_mem_gb DOUBLE PRECISION NOT NULL DEFAULT 0,
                storage_free_gb DOUBLE PRECISION NOT NULL DEFAULT 0,
                uptime_s BIGINT NOT NULL DEFAULT 0
            );
            CREATE TABLE agent_settings (
                agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (agent_id, key)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "quick_tests",
        sqlite: r#"
            CREATE TABLE quick_tests (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                campaign_id TEXT,
                model TEXT NOT NULL,
                engine TEXT NOT NULL,
                suite TEXT NOT NULL,
                force_dispatch INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                result_id TEXT,
                error TEXT
            );
            CREATE TABLE quick_test_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                line TEXT NOT NULL
            );
            CREATE INDEX idx_quick_tests_agent ON quick_tests(agent_id, status);
            CREATE INDEX idx_quick_tests_campaign ON quick_tests(campaign_id);
            CREATE INDEX idx_quick_test_logs_test ON quick_test_logs(test_id);
        "#,
        postgres: r#"
            CREATE TABLE quick_tests (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                campaign_id TEXT,
                model TEXT NOT NULL,
                engine TEXT NOT NULL,
                suite TEXT NOT NULL,
                force_dispatch BOOLEAN NOT NULL DEFAULT FALSE,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                result_id TEXT,
                error TEXT
            );
            CREATE TABLE quick_test_logs (
                id BIGSERIAL PRIMARY KEY,
                test_id TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                line TEXT NOT NULL
            );
            CREATE INDEX idx_quick_tests_agent ON quick_tests(agent_id, status);
            CREATE INDEX idx_quick_tests_campaign ON quick_tests(campaign_id);
            CREATE INDEX idx_quick_test_logs_test ON quick_test_logs(test_id);
        "#,
    },
    Migration {
        version: 4,
        name: "campaigns",
        sqlite: r#"
            CREATE TABLE campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                config_yaml TEXT NOT NULL,
                status TEXT NOT NULL,
                agent_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                total_runs INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );
            CREATE TABLE campaign_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                line TEXT NOT NULL
            );
            CREATE INDEX idx_campaign_logs_campaign ON campaign_logs(campaign_id);
        "#,
        postgres: r#"
            CREATE TABLE campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                config_yaml TEXT NOT NULL,
                status TEXT NOT NULL,
                agent_id TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                total_runs INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );
            CREATE TABLE campaign_logs (
                id BIGSERIAL PRIMARY KEY,
                campaign_id TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                line TEXT NOT NULL
            );
            CREATE INDEX idx_campaign_logs_campaign ON campaign_logs(campaign_id);
        "#,
    },
    Migration {
        version: 5,
        name: "events_settings",
        sqlite: r#"
            CREATE TABLE events (
                seq_id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX idx_events_source ON events(source_id, seq_id);
            CREATE TABLE settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        postgres: r#"
            CREATE TABLE events (
                seq_id BIGSERIAL PRIMARY KEY,
                type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                payload_json JSON NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX idx_events_source ON events(source_id, seq_id);
            CREATE TABLE settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
    },
];
