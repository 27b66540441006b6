//! Control-plane event types: type + payload.
//! Envelope fields (seq, source, ts) are applied separately; see [`crate::envelope`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One control-plane event as it travels over the bus and SSE.
/// The serde tag doubles as the SSE `event:` kind.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// One benchmark log line, stored verbatim.
    Log { line: String },
    /// Quick-test status transition.
    Status {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Campaign status transition.
    CampaignStatus { status: String },
    /// Campaign progress counters.
    Progress {
        total_runs: u32,
        succeeded: u32,
        failed: u32,
        skipped: u32,
    },
    /// Agent liveness change (online / busy / offline).
    AgentPresence { agent_id: String, status: String },
    /// A benchmark result row was persisted.
    RunSaved { run_id: String },
}

impl ControlEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// The serde tag, used as the SSE `event:` kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::Log { .. } => "log",
            ControlEvent::Status { .. } => "status",
            ControlEvent::CampaignStatus { .. } => "campaign_status",
            ControlEvent::Progress { .. } => "progress",
            ControlEvent::AgentPresence { .. } => "agent_presence",
            ControlEvent::RunSaved { .. } => "run_saved",
        }
    }

    /// The log line carried by this event, if it is one.
    pub fn log_line(&self) -> Option<&str> {
        match self {
            ControlEvent::Log { line } => Some(line),
            _ => None,
        }
    }
}
