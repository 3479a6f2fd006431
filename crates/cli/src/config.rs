//! `stagewright.toml` configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use extension_api::ChannelTimeouts;
use llm::Backoff;
use nodes::ResearchTools;
use pipeline::cost::ModelPricing;
use pipeline::tools::ToolServerConfig;
use pipeline::{AgentSlug, CostBudget};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "stagewright.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub model: ModelConfig,
    pub budget: BudgetConfig,
    pub tools: ToolsConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,
    pub context_window: u64,
    pub max_output_tokens: u64,
    /// Overrides the API endpoint, mainly for proxies.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub retry: Backoff,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "claude-sonnet-4-20250514".to_string(),
            context_window: 200_000,
            max_output_tokens: 8_192,
            base_url: None,
            timeout_secs: 300,
            retry: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    /// Per-run limit in USD; unlimited when absent.
    pub limit_usd: Option<f64>,
    /// Overrides the built-in price table.
    pub pricing: Option<ModelPricing>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub server: ToolServerConfig,
    pub research: ResearchTools,
    pub timeouts: ChannelTimeouts,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Relative paths resolve against the config file's directory.
    pub root: PathBuf,
    pub agent: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".stagewright"),
            agent: "default".to_string(),
        }
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("invalid configuration in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no configuration file; using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.model.max_output_tokens >= self.model.context_window {
            bail!(
                "model.max_output_tokens ({}) must be below model.context_window ({})",
                self.model.max_output_tokens,
                self.model.context_window
            );
        }
        if let Some(limit) = self.budget.limit_usd {
            if CostBudget::new(limit).is_none() {
                bail!("budget.limit_usd must be a positive amount, got {limit}");
            }
        }
        self.agent()?;
        Ok(())
    }

    pub fn agent(&self) -> Result<AgentSlug> {
        AgentSlug::new(self.storage.agent.trim()).context("storage.agent must not be empty")
    }

    pub fn budget(&self) -> Option<CostBudget> {
        self.budget.limit_usd.and_then(CostBudget::new)
    }

    /// Configured pricing, else the price table entry for the model.
    pub fn pricing(&self) -> ModelPricing {
        self.budget.pricing.or_else(|| llm::pricing_for(&self.model.name)).unwrap_or_else(|| {
            tracing::warn!(model = %self.model.name, "no pricing known for model; costs are reported as zero");
            ModelPricing::free()
        })
    }

    /// Storage root resolved against `base`.
    pub fn storage_root(&self, base: &Path) -> PathBuf {
        if self.storage.root.is_relative() {
            base.join(&self.storage.root)
        } else {
            self.storage.root.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.model.context_window, 200_000);
        assert_eq!(config.tools.research.web_search.as_str(), "web_search");
        assert_eq!(config.budget(), None);
        assert_eq!(config.pricing(), ModelPricing::new(3.0, 15.0));
    }

    #[test]
    fn sections_are_read() {
        let config = Config::parse(
            r#"
            [model]
            name = "claude-3-5-haiku-latest"
            max_output_tokens = 4096

            [model.retry]
            max_retries = 1
            base_delay = 10
            max_delay = 100

            [budget]
            limit_usd = 1.5

            [tools.server]
            command = "./bin/kb-server"
            args = ["--stdio"]

            [tools.research]
            hybrid_search = "kb_search"
            evidence_cap = 12

            [storage]
            root = "/var/lib/stagewright"
            agent = "field-engineer"
            "#,
        )
        .unwrap();
        assert_eq!(config.model.retry.max_retries, 1);
        assert_eq!(config.budget().map(|b| b.as_f64()), Some(1.5));
        assert_eq!(config.pricing(), ModelPricing::new(0.8, 4.0));
        assert_eq!(config.tools.server.args, vec!["--stdio".to_string()]);
        assert_eq!(config.tools.research.hybrid_search.as_str(), "kb_search");
        assert_eq!(config.tools.research.evidence_cap, 12);
        assert_eq!(config.agent().unwrap().as_str(), "field-engineer");
        assert_eq!(
            config.storage_root(Path::new("/home/x")),
            PathBuf::from("/var/lib/stagewright")
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::parse("[budget]\nlimit_usd = -1.0").is_err());
        assert!(Config::parse("[model]\ncontext_window = 1000\nmax_output_tokens = 2000").is_err());
        assert!(Config::parse("[storage]\nagent = \" \"").is_err());
        assert!(Config::parse("[unknown]\nx = 1").is_err());
    }
}
