//! Agent manager: registration, token auth, heartbeat ingestion, the
//! per-agent command queue, settings, and the liveness sweep.

pub mod sweeper;
pub mod token;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use stream_event::{
    ControlEvent, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
    SourceId, WireCommand,
};

use crate::bus::EventBus;
use crate::error::KittError;
use crate::store::{
    AgentRecord, AgentTelemetry, HeartbeatTelemetry, QuickTestFilter, Store,
};
use crate::types::{AgentStatus, TestStatus};

pub const SETTING_MODEL_STORAGE_DIR: &str = "model_storage_dir";
pub const SETTING_MODEL_SHARE_SOURCE: &str = "model_share_source";
pub const SETTING_MODEL_SHARE_MOUNT: &str = "model_share_mount";
pub const SETTING_AUTO_CLEANUP: &str = "auto_cleanup";
pub const SETTING_HEARTBEAT_INTERVAL: &str = "heartbeat_interval_s";
pub const SETTING_KITT_IMAGE: &str = "kitt_image";

pub const DEFAULT_HEARTBEAT_INTERVAL_S: u64 = 30;
const HEARTBEAT_INTERVAL_MIN_S: u64 = 10;
const HEARTBEAT_INTERVAL_MAX_S: u64 = 300;
/// While a test runs, heartbeats slow down to at least this.
const BUSY_HEARTBEAT_FLOOR_S: u64 = 60;
/// Heartbeats may be late by this factor before an agent goes offline.
const OFFLINE_AFTER_INTERVALS: i64 = 3;

pub struct AgentManager {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    queues: Mutex<HashMap<String, VecDeque<WireCommand>>>,
    /// Serializes the lookup-then-write section of register.
    register_lock: Mutex<()>,
}

impl AgentManager {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            queues: Mutex::new(HashMap::new()),
            register_lock: Mutex::new(()),
        }
    }

    /// Registers an agent, or heals an existing row found by id or name.
    /// A found row keeps its token hash so the agent's existing token stays
    /// valid after a controller database reset on the agent side.
    pub fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, KittError> {
        let _guard = self
            .register_lock
            .lock()
            .map_err(|_| KittError::Fatal("register lock poisoned".into()))?;

        let existing = match &req.agent_id {
            Some(id) => match self.store.get_agent(id)? {
                Some(a) => Some(a),
                None => self.store.get_agent_by_name(&req.name)?,
            },
            None => self.store.get_agent_by_name(&req.name)?,
        };

        let (record, raw_token) = match existing {
            Some(mut agent) => {
                agent.name = req.name.clone();
                agent.host = req.host.clone();
                agent.port = req.port;
                agent.cpu_arch = req.cpu_arch;
                agent.hardware = req.hardware.clone();
                agent.status = AgentStatus::Online;
                agent.last_heartbeat = Some(Utc::now());
                agent.kitt_version = req.kitt_version.clone();
                (agent, String::new())
            }
            None => {
                let (raw, prefix, hash) = token::generate();
                let record = AgentRecord {
                    id: req
                        .agent_id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    name: req.name.clone(),
                    host: req.host.clone(),
                    port: req.port,
                    cpu_arch: req.cpu_arch,
                    hardware: req.hardware.clone(),
                    status: AgentStatus::Online,
                    last_heartbeat: Some(Utc::now()),
                    registered_at: Utc::now(),
                    is_test_agent: false,
                    token_prefix: prefix,
                    token_hash: hash,
                    kitt_version: req.kitt_version.clone(),
                    telemetry: AgentTelemetry::default(),
                };
                (record, raw)
            }
        };
        self.store.upsert_agent(&record)?;
        self.publish_presence(&record.id, AgentStatus::Online);
        tracing::info!(agent = %record.name, id = %record.id, "agent registered");
        Ok(RegisterResponse {
            agent_id: record.id.clone(),
            token: raw_token,
            heartbeat_interval_s: self.heartbeat_interval(&record.id)?,
        })
    }

    /// Creates a virtual agent for UI and integration testing. Dispatch to it
    /// is simulated; the sweeper never marks it offline.
    pub fn register_test_agent(&self, name: &str) -> Result<AgentRecord, KittError> {
        let _guard = self
            .register_lock
            .lock()
            .map_err(|_| KittError::Fatal("register lock poisoned".into()))?;
        if let Some(existing) = self.store.get_agent_by_name(name)? {
            if existing.is_test_agent {
                return Ok(existing);
            }
            return Err(KittError::Conflict(format!(
                "agent name {name:?} belongs to a real agent"
            )));
        }
        let (_, prefix, hash) = token::generate();
        let record = AgentRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            cpu_arch: stream_event::CpuArch::Amd64,
            hardware: stream_event::HardwareInfo {
                gpu: "virtual".to_string(),
                cpu: "virtual".to_string(),
                ram_gb: 64.0,
                compute_capability: None,
                environment_type: "test".to_string(),
                vram_gb: Some(24.0),
            },
            status: AgentStatus::Online,
            last_heartbeat: Some(Utc::now()),
            registered_at: Utc::now(),
            is_test_agent: true,
            token_prefix: prefix,
            token_hash: hash,
            kitt_version: env!("CARGO_PKG_VERSION").to_string(),
            telemetry: AgentTelemetry::default(),
        };
        self.store.upsert_agent(&record)?;
        Ok(record)
    }

    /// Locates an agent by id (or by name as a recovery path) and verifies
    /// the presented token in constant time.
    pub fn authenticate(&self, agent_key: &str, raw_token: &str) -> Result<AgentRecord, KittError> {
        let agent = match self.store.get_agent(agent_key)? {
            Some(a) => a,
            None => self
                .store
                .get_agent_by_name(agent_key)?
                .ok_or_else(|| KittError::NotFound(format!("agent {agent_key}")))?,
        };
        if token::verify(raw_token, &agent.token_hash) {
            Ok(agent)
        } else {
            Err(KittError::Auth("invalid agent token".into()))
        }
    }

    /// Ingests a heartbeat: updates liveness + telemetry, drains the command
    /// queue, and returns the interval and settings the agent should apply.
    pub fn heartbeat(
        &self,
        agent_id: &str,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, KittError> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| KittError::NotFound(format!("agent {agent_id}")))?;

        let mut status = req
            .status
            .parse::<AgentStatus>()
            .map_err(KittError::Validation)?;
        if req.current_test_id.is_some() {
            status = AgentStatus::Busy;
        }
        self.store.record_heartbeat(
            agent_id,
            &HeartbeatTelemetry {
                status,
                at: Utc::now(),
                telemetry: AgentTelemetry {
                    gpu_util: req.gpu_util,
                    gpu_mem_gb: req.gpu_mem_gb,
                    storage_free_gb: req.storage_free_gb,
                    uptime_s: req.uptime_s as i64,
                },
            },
        )?;
        if agent.status != status {
            self.publish_presence(agent_id, status);
        }

        let commands = self.drain_commands(agent_id)?;
        let mut interval_s = self.heartbeat_interval(agent_id)?;
        let running = self.store.list_quick_tests(&QuickTestFilter {
            agent_id: Some(agent_id.to_string()),
            status: Some(TestStatus::Running),
            ..Default::default()
        })?;
        if !running.is_empty() {
            interval_s = interval_s.max(BUSY_HEARTBEAT_FLOOR_S);
        }
        Ok(HeartbeatResponse {
            interval_s,
            settings: self.effective_settings(agent_id)?,
            commands,
        })
    }

    /// FIFO enqueue. Offline agents reject, test agents always accept.
    pub fn queue_command(&self, agent_id: &str, cmd: WireCommand) -> Result<(), KittError> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| KittError::NotFound(format!("agent {agent_id}")))?;
        if agent.status == AgentStatus::Offline && !agent.is_test_agent {
            return Err(KittError::Conflict(format!(
                "agent {} is offline",
                agent.name
            )));
        }
        let mut queues = self.lock_queues()?;
        queues.entry(agent_id.to_string()).or_default().push_back(cmd);
        Ok(())
    }

    /// Commands waiting for the next heartbeat, in dispatch order.
    pub fn pending_commands(&self, agent_id: &str) -> Result<Vec<WireCommand>, KittError> {
        let queues = self.lock_queues()?;
        Ok(queues
            .get(agent_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn drain_commands(&self, agent_id: &str) -> Result<Vec<WireCommand>, KittError> {
        let mut queues = self.lock_queues()?;
        Ok(queues
            .get_mut(agent_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default())
    }

    /// Mints a fresh token, stores hash + prefix, and returns the raw value
    /// exactly once.
    pub fn rotate_token(&self, agent_id: &str) -> Result<String, KittError> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| KittError::NotFound(format!("agent {agent_id}")))?;
        let (raw, prefix, hash) = token::generate();
        self.store.set_agent_token(&agent.id, &prefix, &hash)?;
        tracing::info!(agent = %agent.name, prefix = %prefix, "agent token rotated");
        Ok(raw)
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentRecord, KittError> {
        self.store
            .get_agent(agent_id)?
            .ok_or_else(|| KittError::NotFound(format!("agent {agent_id}")))
    }

    pub fn list(&self) -> Result<Vec<AgentRecord>, KittError> {
        Ok(self.store.list_agents()?)
    }

    pub fn remove(&self, agent_id: &str) -> Result<(), KittError> {
        if !self.store.delete_agent(agent_id)? {
            return Err(KittError::NotFound(format!("agent {agent_id}")));
        }
        if let Ok(mut queues) = self.lock_queues() {
            queues.remove(agent_id);
        }
        Ok(())
    }

    /// Stores one setting after validating the key and its value.
    pub fn put_setting(&self, agent_id: &str, key: &str, value: &str) -> Result<(), KittError> {
        self.get(agent_id)?;
        validate_setting(key, value)?;
        Ok(self.store.put_agent_setting(agent_id, key, value)?)
    }

    /// Settings with defaults applied for keys the operator never set.
    pub fn effective_settings(
        &self,
        agent_id: &str,
    ) -> Result<BTreeMap<String, String>, KittError> {
        let mut settings = self.store.agent_settings(agent_id)?;
        settings
            .entry(SETTING_AUTO_CLEANUP.to_string())
            .or_insert_with(|| "true".to_string());
        settings
            .entry(SETTING_HEARTBEAT_INTERVAL.to_string())
            .or_insert_with(|| DEFAULT_HEARTBEAT_INTERVAL_S.to_string());
        Ok(settings)
    }

    fn heartbeat_interval(&self, agent_id: &str) -> Result<u64, KittError> {
        let settings = self.store.agent_settings(agent_id)?;
        let configured = settings
            .get(SETTING_HEARTBEAT_INTERVAL)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_S);
        Ok(configured.clamp(HEARTBEAT_INTERVAL_MIN_S, HEARTBEAT_INTERVAL_MAX_S))
    }

    /// One liveness pass: real agents with no heartbeat for three intervals
    /// go offline. Test agents are always reachable.
    pub fn sweep(&self) -> Result<(), KittError> {
        let now = Utc::now();
        for agent in self.store.list_agents()? {
            if agent.is_test_agent || agent.status == AgentStatus::Offline {
                continue;
            }
            let interval = self.heartbeat_interval(&agent.id)? as i64;
            let cutoff = chrono::Duration::seconds(OFFLINE_AFTER_INTERVALS * interval);
            let stale = match agent.last_heartbeat {
                Some(last) => now - last > cutoff,
                None => now - agent.registered_at > cutoff,
            };
            if stale {
                tracing::warn!(agent = %agent.name, "no heartbeat, marking offline");
                self.store.set_agent_status(&agent.id, AgentStatus::Offline)?;
                self.publish_presence(&agent.id, AgentStatus::Offline);
            }
        }
        Ok(())
    }

    fn publish_presence(&self, agent_id: &str, status: AgentStatus) {
        let result = self.bus.publish(
            &SourceId::Agent(agent_id.to_string()),
            ControlEvent::AgentPresence {
                agent_id: agent_id.to_string(),
                status: status.as_str().to_string(),
            },
        );
        if let Err(e) = result {
            tracing::warn!(agent = agent_id, error = %e, "presence event not published");
        }
    }

    fn lock_queues(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<WireCommand>>>, KittError> {
        self.queues
            .lock()
            .map_err(|_| KittError::Fatal("command queue lock poisoned".into()))
    }
}

fn validate_setting(key: &str, value: &str) -> Result<(), KittError> {
    match key {
        SETTING_MODEL_STORAGE_DIR | SETTING_MODEL_SHARE_SOURCE | SETTING_MODEL_SHARE_MOUNT
        | SETTING_KITT_IMAGE => {
            if value.trim().is_empty() {
                return Err(KittError::Validation(format!("{key} must not be empty")));
            }
            Ok(())
        }
        SETTING_AUTO_CLEANUP => match value {
            "true" | "false" => Ok(()),
            other => Err(KittError::Validation(format!(
                "{key} must be true or false, got {other:?}"
            ))),
        },
        SETTING_HEARTBEAT_INTERVAL => {
            let parsed: u64 = value
                .parse()
                .map_err(|_| KittError::Validation(format!("{key} must be an integer")))?;
            if !(HEARTBEAT_INTERVAL_MIN_S..=HEARTBEAT_INTERVAL_MAX_S).contains(&parsed) {
                return Err(KittError::Validation(format!(
                    "{key} must be between {HEARTBEAT_INTERVAL_MIN_S} and {HEARTBEAT_INTERVAL_MAX_S}"
                )));
            }
            Ok(())
        }
        other => Err(KittError::Validation(format!(
            "unknown setting key: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;
    use stream_event::{CommandKind, CpuArch, HardwareInfo};

    fn manager() -> (tempfile::TempDir, AgentManager) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> =
            Arc::new(SqliteStore::open(dir.path().join("kitt.db")).unwrap());
        store.migrate().unwrap();
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        (dir, AgentManager::new(store, bus))
    }

    fn register_req(name: &str) -> RegisterRequest {
        RegisterRequest {
            agent_id: None,
            name: name.to_string(),
            host: "10.0.0.5".into(),
            port: 9101,
            cpu_arch: CpuArch::Arm64,
            hardware: HardwareInfo {
                gpu: "Apple M3".into(),
                cpu: "M3".into(),
                ram_gb: 32.0,
                compute_capability: None,
                environment_type: "metal".into(),
                vram_gb: Some(32.0),
            },
            kitt_version: "0.2.0".into(),
        }
    }

    #[test]
    fn register_then_reregister_preserves_token_and_row() {
        let (_dir, mgr) = manager();
        let first = mgr.register(&register_req("nodeA")).unwrap();
        assert!(!first.token.is_empty());

        // Same name again, as after an agent-side state wipe.
        let second = mgr.register(&register_req("nodeA")).unwrap();
        assert_eq!(second.agent_id, first.agent_id);
        assert!(second.token.is_empty());
        assert_eq!(mgr.list().unwrap().len(), 1);

        // The original token still authenticates.
        let agent = mgr.authenticate(&first.agent_id, &first.token).unwrap();
        assert_eq!(agent.name, "nodeA");
    }

    #[test]
    fn authenticate_falls_back_to_name() {
        let (_dir, mgr) = manager();
        let resp = mgr.register(&register_req("nodeA")).unwrap();
        let agent = mgr.authenticate("nodeA", &resp.token).unwrap();
        assert_eq!(agent.id, resp.agent_id);
        assert!(matches!(
            mgr.authenticate("nodeA", "wrong"),
            Err(KittError::Auth(_))
        ));
        assert!(matches!(
            mgr.authenticate("ghost", &resp.token),
            Err(KittError::NotFound(_))
        ));
    }

    #[test]
    fn heartbeat_drains_commands_fifo() {
        let (_dir, mgr) = manager();
        let resp = mgr.register(&register_req("nodeA")).unwrap();
        for n in 0..3 {
            mgr.queue_command(
                &resp.agent_id,
                WireCommand {
                    id: format!("c-{n}"),
                    kind: CommandKind::RunTest,
                    payload: serde_json::json!({}),
                },
            )
            .unwrap();
        }
        let hb = HeartbeatRequest {
            status: "online".into(),
            current_test_id: None,
            gpu_util: 0.0,
            gpu_mem_gb: 0.0,
            storage_free_gb: 100.0,
            uptime_s: 60,
        };
        let out = mgr.heartbeat(&resp.agent_id, &hb).unwrap();
        let ids: Vec<_> = out.commands.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c-0", "c-1", "c-2"]);
        // Queue is drained; next heartbeat gets nothing.
        let out = mgr.heartbeat(&resp.agent_id, &hb).unwrap();
        assert!(out.commands.is_empty());
        assert_eq!(out.interval_s, DEFAULT_HEARTBEAT_INTERVAL_S);
    }

    #[test]
    fn queue_to_offline_agent_rejects() {
        let (_dir, mgr) = manager();
        let resp = mgr.register(&register_req("nodeA")).unwrap();
        mgr.store
            .set_agent_status(&resp.agent_id, AgentStatus::Offline)
            .unwrap();
        let err = mgr
            .queue_command(
                &resp.agent_id,
                WireCommand {
                    id: "c".into(),
                    kind: CommandKind::CleanupStorage,
                    payload: serde_json::json!({}),
                },
            )
            .unwrap_err();
        assert!(matches!(err, KittError::Conflict(_)));
    }

    #[test]
    fn setting_validation() {
        let (_dir, mgr) = manager();
        let resp = mgr.register(&register_req("nodeA")).unwrap();
        mgr.put_setting(&resp.agent_id, SETTING_HEARTBEAT_INTERVAL, "45")
            .unwrap();
        assert!(mgr
            .put_setting(&resp.agent_id, SETTING_HEARTBEAT_INTERVAL, "5")
            .is_err());
        assert!(mgr
            .put_setting(&resp.agent_id, SETTING_AUTO_CLEANUP, "yes")
            .is_err());
        assert!(mgr.put_setting(&resp.agent_id, "mystery_key", "x").is_err());
        let eff = mgr.effective_settings(&resp.agent_id).unwrap();
        assert_eq!(eff.get(SETTING_HEARTBEAT_INTERVAL).unwrap(), "45");
        assert_eq!(eff.get(SETTING_AUTO_CLEANUP).unwrap(), "true");
    }

    #[test]
    fn rotate_token_invalidates_old() {
        let (_dir, mgr) = manager();
        let resp = mgr.register(&register_req("nodeA")).unwrap();
        let fresh = mgr.rotate_token(&resp.agent_id).unwrap();
        assert!(mgr.authenticate(&resp.agent_id, &resp.token).is_err());
        assert!(mgr.authenticate(&resp.agent_id, &fresh).is_ok());
    }

    #[test]
    fn sweep_marks_stale_real_agents_offline_only() {
        let (_dir, mgr) = manager();
        let resp = mgr.register(&register_req("nodeA")).unwrap();
        let test_agent = mgr.register_test_agent("virtual-a").unwrap();
        // Backdate the real agent's heartbeat far beyond three intervals.
        let mut agent = mgr.get(&resp.agent_id).unwrap();
        agent.last_heartbeat = Some(Utc::now() - chrono::Duration::hours(1));
        mgr.store.upsert_agent(&agent).unwrap();

        mgr.sweep().unwrap();
        assert_eq!(mgr.get(&resp.agent_id).unwrap().status, AgentStatus::Offline);
        assert_eq!(mgr.get(&test_agent.id).unwrap().status, AgentStatus::Online);
    }
}
