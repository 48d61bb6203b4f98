use std::path::Path;

use anyhow::{Context, Result};
use sage_knowledge::KnowledgeConfig;
use sage_memory::MemoryConfig;
use sage_personality::PersonalityConfig;
use sage_runtime::OrchestratorConfig;
use sage_sandbox::SandboxPolicy;
use sage_tools::ToolsConfig;
use serde::{Deserialize, Serialize};

/// Configuration for every part of the assistant. Sections left out of a
/// config file keep their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SageConfig {
    pub orchestrator: OrchestratorConfig,
    pub memory: MemoryConfig,
    pub knowledge: KnowledgeConfig,
    pub personality: PersonalityConfig,
    pub tools: ToolsConfig,
    pub sandbox: SandboxPolicy,
}

impl SageConfig {
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use sage_runtime::ExchangePolicy;

    use super::*;

    #[tokio::test]
    async fn file_sections_override_defaults() -> Result<()> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!("sage-config-{nanos}.json"));
        tokio::fs::write(
            &path,
            r#"{"orchestrator": {"exchange_policy": "reject"}, "memory": {"max_window": 7}}"#,
        )
        .await?;

        let config = SageConfig::from_json_file(&path).await?;
        assert_eq!(config.orchestrator.exchange_policy, ExchangePolicy::Reject);
        assert_eq!(config.memory.max_window, 7);
        assert_eq!(config.tools.timeout_secs, 30);

        let _ = tokio::fs::remove_file(path).await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_names_the_path() {
        let error = SageConfig::from_json_file("/nonexistent/sage.json")
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("/nonexistent/sage.json"));
    }
}
