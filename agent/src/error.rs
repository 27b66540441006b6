//! Daemon-side errors. The daemon reports failures to the controller via
//! status messages; it never disconnects on them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config: {0}")]
    Config(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    /// Heartbeat answered 404: the controller forgot us, re-register.
    #[error("agent not registered")]
    NotRegistered,
    #[error("controller returned {status}: {message}")]
    Controller { status: u16, message: String },
    #[error("container runtime: {0}")]
    Runtime(String),
    #[error("model resolution: {0}")]
    Model(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}
