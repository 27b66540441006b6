//! Envelope (seq, source, ts) and source identifiers.
//! The bus assigns `seq` on publication; SSE uses it as the event id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::ControlEvent;

/// Identifies the stream an event belongs to. The string form
/// (`quicktest:<id>`, `campaign:<id>`, `agent:<id>`) is what subscribers key on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SourceId {
    QuickTest(String),
    Campaign(String),
    Agent(String),
    /// Controller-level events with no owning entity.
    Controller,
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::QuickTest(id) => write!(f, "quicktest:{id}"),
            SourceId::Campaign(id) => write!(f, "campaign:{id}"),
            SourceId::Agent(id) => write!(f, "agent:{id}"),
            SourceId::Controller => write!(f, "controller"),
        }
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "controller" {
            return Ok(SourceId::Controller);
        }
        match s.split_once(':') {
            Some(("quicktest", id)) if !id.is_empty() => Ok(SourceId::QuickTest(id.to_string())),
            Some(("campaign", id)) if !id.is_empty() => Ok(SourceId::Campaign(id.to_string())),
            Some(("agent", id)) if !id.is_empty() => Ok(SourceId::Agent(id.to_string())),
            _ => Err(format!("unrecognized source id: {s}")),
        }
    }
}

impl From<SourceId> for String {
    fn from(s: SourceId) -> String {
        s.to_string()
    }
}

impl TryFrom<String> for SourceId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Envelope fields stamped onto each published event.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    /// Monotone sequence number; assigned by the bus from the event store.
    pub seq: Option<u64>,
    /// String form of the owning [`SourceId`].
    pub source: Option<String>,
    /// ISO-8601 publication timestamp.
    pub ts: Option<String>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_ts(mut self, ts: impl Into<String>) -> Self {
        self.ts = Some(ts.into());
        self
    }

    /// Merges envelope fields into the given JSON object (top-level only).
    /// Does not overwrite existing keys.
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        if let Some(seq) = self.seq {
            obj.entry("seq")
                .or_insert_with(|| Value::Number(serde_json::Number::from(seq)));
        }
        if let Some(ref source) = self.source {
            obj.entry("source")
                .or_insert_with(|| Value::String(source.clone()));
        }
        if let Some(ref ts) = self.ts {
            obj.entry("ts").or_insert_with(|| Value::String(ts.clone()));
        }
    }
}

/// Converts an event to JSON with envelope fields injected.
/// Returns the final value (type + payload + seq, source, ts).
pub fn to_json(
    event: &ControlEvent,
    envelope: &Envelope,
) -> Result<Value, serde_json::Error> {
    let mut value = event.to_value()?;
    envelope.inject_into(&mut value);
    Ok(value)
}
