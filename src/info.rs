//! Agent identity
//!
//! The agent ID is generated once and persisted in the data directory so it
//! survives restarts. Version and snapshot come from the build.

use crate::transpiler::AgentIdentity;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Identity of the running agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    #[serde(skip, default = "build_version")]
    pub version: String,
    #[serde(skip, default = "build_snapshot")]
    pub snapshot: bool,
    #[serde(skip, default = "local_hostname")]
    pub hostname: String,
}

fn build_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn build_snapshot() -> bool {
    env!("CARGO_PKG_VERSION").contains("-SNAPSHOT")
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

impl AgentInfo {
    /// Identity with a fixed ID, for callers that already know it.
    pub fn with_id(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            version: build_version(),
            snapshot: build_snapshot(),
            hostname: local_hostname(),
        }
    }

    /// Load the persisted identity from `path`, creating one when absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read agent info {}", path.display()))?;
            let info: AgentInfo = serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse agent info {}", path.display()))?;
            if !info.agent_id.is_empty() {
                return Ok(info);
            }
        }

        let info = Self::with_id(uuid::Uuid::new_v4().to_string());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(&info)?)
            .with_context(|| format!("Failed to write agent info {}", path.display()))?;
        info!("Generated agent id {}", info.agent_id);
        Ok(info)
    }
}

impl AgentIdentity for AgentInfo {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn snapshot(&self) -> bool {
        self.snapshot
    }
}
