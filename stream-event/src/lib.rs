//! Control-plane wire protocol: events, envelopes, and agent messages.
//!
//! This crate defines the wire shape of bus/SSE events (type + payload +
//! envelope) and the agent ↔ controller JSON messages. It does not depend on
//! kitt; the controller and the agent daemon both build on it.

pub mod envelope;
pub mod event;
pub mod wire;

pub use envelope::{to_json, Envelope, SourceId};
pub use event::ControlEvent;
pub use wire::{
    CommandKind, CpuArch, HardwareInfo, HeartbeatRequest, HeartbeatResponse, LogLine,
    RegisterRequest, RegisterResponse, ReportedStatus, RunTestPayload, StatusUpdate,
    StopContainerPayload, WireCommand,
};
