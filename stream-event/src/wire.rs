//! Agent ↔ controller wire messages (JSON over HTTP).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CPU architecture of an agent host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuArch {
    Amd64,
    Arm64,
}

impl CpuArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuArch::Amd64 => "amd64",
            CpuArch::Arm64 => "arm64",
        }
    }
}

/// Hardware snapshot reported at registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub gpu: String,
    pub cpu: String,
    pub ram_gb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<String>,
    pub environment_type: String,
    /// On unified-memory hosts this is the RAM shared with the GPU.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_gb: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub cpu_arch: CpuArch,
    pub hardware: HardwareInfo,
    pub kitt_version: String,
}

/// The raw token is returned exactly once, on first registration. A
/// re-register of a known agent leaves `token` empty and the agent keeps
/// the token it already holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    pub heartbeat_interval_s: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_test_id: Option<String>,
    pub gpu_util: f64,
    pub gpu_mem_gb: f64,
    pub storage_free_gb: f64,
    pub uptime_s: u64,
}

/// Dispatch intent kinds carried on the per-agent queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    RunTest,
    CleanupStorage,
    StopContainer,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireCommand {
    pub id: String,
    pub kind: CommandKind,
    pub payload: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub interval_s: u64,
    pub settings: BTreeMap<String, String>,
    pub commands: Vec<WireCommand>,
}

/// Payload of a `run_test` command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunTestPayload {
    pub test_id: String,
    pub model: String,
    pub engine: String,
    pub suite: String,
}

/// Payload of a `stop_container` command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopContainerPayload {
    pub test_id: String,
}

/// Status an agent may report for a quick test. `queued`/`dispatched`
/// are controller-side states and are not accepted over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ReportedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_json: Option<Value>,
}

/// One pushed log line; batches are `Vec<LogLine>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogLine {
    pub ts: String,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_kind_wire_form() {
        let cmd = WireCommand {
            id: "c-1".into(),
            kind: CommandKind::RunTest,
            payload: serde_json::json!({"test_id":"qt-1"}),
        };
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["kind"], "run_test");
    }

    #[test]
    fn register_request_optional_id() {
        let json = r#"{
            "name": "nodeA", "host": "10.0.0.5", "port": 9101,
            "cpu_arch": "arm64",
            "hardware": {"gpu":"Apple M3","cpu":"M3","ram_gb":32.0,"environment_type":"metal","vram_gb":32.0},
            "kitt_version": "0.2.0"
        }"#;
        let req: RegisterRequest = serde_json::from_str(json).unwrap();
        assert!(req.agent_id.is_none());
        assert_eq!(req.cpu_arch, CpuArch::Arm64);
        assert_eq!(req.hardware.vram_gb, Some(32.0));
    }

    #[test]
    fn status_update_rejects_controller_states() {
        let err = serde_json::from_str::<StatusUpdate>(r#"{"status":"queued"}"#);
        assert!(err.is_err());
    }
}
