//! `agent.yaml`: the daemon's persistent identity and connection settings,
//! stored under the kitt home directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub controller_url: String,
    /// Defaults to the hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Assigned on first registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Issued once on first registration; kept across re-registers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Port this agent advertises for diagnostics.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_storage_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_share_mount: Option<PathBuf>,
}

fn default_port() -> u16 {
    9101
}

impl AgentConfig {
    pub fn new(controller_url: impl Into<String>) -> Self {
        Self {
            controller_url: controller_url.into(),
            name: None,
            agent_id: None,
            token: None,
            port: default_port(),
            model_storage_dir: None,
            model_share_mount: None,
        }
    }

    pub fn path(home: &Path) -> PathBuf {
        home.join("agent.yaml")
    }

    pub fn load(home: &Path) -> Result<Self, AgentError> {
        let path = Self::path(home);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| AgentError::Config(format!("read {path:?}: {e}")))?;
        serde_yaml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("parse {path:?}: {e}")))
    }

    pub fn save(&self, home: &Path) -> Result<(), AgentError> {
        std::fs::create_dir_all(home)
            .map_err(|e| AgentError::Config(format!("create {home:?}: {e}")))?;
        let path = Self::path(home);
        let content = serde_yaml::to_string(self)
            .map_err(|e| AgentError::Config(format!("serialize config: {e}")))?;
        std::fs::write(&path, content)
            .map_err(|e| AgentError::Config(format!("write {path:?}: {e}")))?;
        Ok(())
    }

    /// Effective agent name: configured, else hostname, else a fixed tag.
    pub fn effective_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "kitt-agent".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::new("http://controller:9100");
        config.name = Some("nodeA".into());
        config.agent_id = Some("a-1".into());
        config.token = Some("t".into());
        config.save(dir.path()).unwrap();
        let loaded = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.controller_url, "http://controller:9100");
        assert_eq!(loaded.agent_id.as_deref(), Some("a-1"));
        assert_eq!(loaded.port, 9101);
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            AgentConfig::path(dir.path()),
            "controller_url: http://x\nmystery: 1\n",
        )
        .unwrap();
        assert!(AgentConfig::load(dir.path()).is_err());
    }
}
