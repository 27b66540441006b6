//! # Kitt
//!
//! Distributed benchmark orchestration for LLM inference engines. A central
//! controller drives a fleet of remote agents attached to GPU servers:
//! campaigns (a matrix of models × engines × suites) decompose into quick
//! tests, dispatched one at a time over a heartbeat-pull protocol, with live
//! logs, per-test watchdogs, cancellation, and persistent results.
//!
//! This crate is the control-plane core. The HTTP/SSE surface lives in the
//! `serve` crate, the remote daemon in `agent`, and the shared wire protocol
//! in `stream-event`.
//!
//! ## Main modules
//!
//! - [`store`]: driver-pluggable persistence ([`store::Store`]; embedded
//!   [`store::sqlite::SqliteStore`], server `store::postgres::PostgresStore`
//!   behind the `postgres` feature), forward-only migrations.
//! - [`bus`]: in-process pub/sub keyed by source id ([`bus::EventBus`]),
//!   buffered per-subscriber channels, log persistence, replay.
//! - [`agents`]: registration, token auth, heartbeats, command queues,
//!   settings, liveness sweep ([`agents::AgentManager`]).
//! - [`quicktest`]: the dispatch state machine, preflight checks, the
//!   simulated path for test agents, per-test watchdogs.
//! - [`campaign`]: YAML config, matrix expansion, the sequential executor.
//! - [`engines`]: compile-time engine capability registry.
//! - [`context`]: the typed [`context::Controller`] passed explicitly where
//!   the original design reached for globals.
//! - [`error`]: the [`error::KittError`] taxonomy mapped to HTTP at the edge.

pub mod agents;
pub mod bus;
pub mod campaign;
pub mod context;
pub mod engines;
pub mod error;
pub mod fingerprint;
pub mod quicktest;
pub mod retry;
pub mod store;
pub mod types;

pub use context::{Controller, Tuning};
pub use error::{KittError, PreflightReason};
pub use types::{AgentStatus, CampaignStatus, ModelFormat, TestStatus};
