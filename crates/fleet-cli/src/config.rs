//! `fleet.toml` loading.
//!
//! Every section is optional; an empty file runs the orchestrator with its
//! defaults on `0.0.0.0:3000` without auth.

use anyhow::Context;
use fleet_core::AgentDescriptor;
use fleet_orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Top-level `fleet.toml` layout.
#[derive(Debug, Default, Deserialize)]
pub struct FleetConfig {
    /// Orchestrator tuning.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,
    /// API key auth.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Agents registered at startup.
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

/// Where the gateway listens.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Gateway authentication settings.
#[derive(Debug, Default, Deserialize)]
pub struct SecurityConfig {
    /// Accepted keys; empty disables auth.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}

impl FleetConfig {
    /// Parse a TOML document and validate the orchestrator section.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator.validate()?;
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                anyhow::bail!("agent '{}' is declared more than once", agent.id);
            }
        }
        if self.security.api_keys.iter().any(|k| k.trim().is_empty()) {
            anyhow::bail!("api_keys must not contain empty keys");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_core::{Capability, TransportKind};
    use fleet_orchestrator::SelectionStrategy;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FleetConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.orchestrator.max_retries, 3);
        assert!(config.agents.is_empty());
        assert!(config.security.api_keys.is_empty());
    }

    #[test]
    fn test_full_file() {
        let raw = r#"
            [orchestrator]
            selection_strategy = "least_loaded"
            max_retries = 5

            [server]
            port = 8080

            [security]
            api_keys = ["k1"]

            [[agents]]
            id = "builder"
            capabilities = ["backend", "testing"]
            max_concurrent_tasks = 2

            [[agents]]
            id = "pusher"
            capabilities = ["frontend"]
            transport = "persistent-socket"
        "#;
        let config = FleetConfig::parse(raw).unwrap();
        assert_eq!(config.orchestrator.selection_strategy, SelectionStrategy::LeastLoaded);
        assert_eq!(config.orchestrator.max_retries, 5);
        // Unset keys keep their defaults.
        assert_eq!(config.orchestrator.heartbeat_interval_secs, 30);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].capabilities, vec![Capability::Backend, Capability::Testing]);
        assert_eq!(config.agents[1].max_concurrent_tasks, 1);
        assert_eq!(config.agents[1].transport, TransportKind::PersistentSocket);
    }

    #[test]
    fn test_duplicate_agents_rejected() {
        let raw = r#"
            [[agents]]
            id = "a"
            capabilities = ["general"]

            [[agents]]
            id = "a"
            capabilities = ["backend"]
        "#;
        let err = FleetConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_invalid_orchestrator_values_rejected() {
        assert!(FleetConfig::parse("[orchestrator]\nmax_retries = 0\n").is_err());
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nhost = \"127.0.0.1\"").unwrap();
        let config = FleetConfig::load(file.path()).await.unwrap();
        assert_eq!(config.server.host, "127.0.0.1");

        let missing = FleetConfig::load(Path::new("/nonexistent/fleet.toml")).await;
        assert!(missing.is_err());
    }
}
