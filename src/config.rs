use std::path::{Path, PathBuf};

use anyhow::Context;
use secrecy::SecretString;
use serde::Deserialize;

use quill_core::model::ModelOptions;
use quill_engine::EngineConfig;
use quill_server::ServerConfig;
use quill_telemetry::LoggingSection;

/// Which model endpoint serves generations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Bedrock,
    Anthropic,
    Mock,
}

/// `[model]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub provider: Provider,
    pub api_key: Option<SecretString>,
    #[serde(flatten)]
    pub options: ModelOptions,
}

/// `[store]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
    /// Keep conversations in memory only.
    pub in_memory: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: quill_home().join("quill.db"),
            in_memory: false,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QuillConfig {
    pub engine: EngineConfig,
    pub model: ModelSection,
    pub server: ServerConfig,
    pub store: StoreSection,
    pub logging: LoggingSection,
}

/// Command-line overrides shared by every subcommand.
#[derive(Debug, Default, clap::Args)]
pub struct Overrides {
    /// Model provider.
    #[arg(long, global = true, env = "QUILL_PROVIDER", value_enum)]
    pub provider: Option<Provider>,
    /// Foundation model identifier.
    #[arg(long, global = true, env = "QUILL_MODEL")]
    pub model: Option<String>,
    #[arg(long, global = true, env = "AWS_REGION")]
    pub region: Option<String>,
    /// SQLite database for conversation history.
    #[arg(long, global = true, env = "QUILL_DB_PATH")]
    pub db_path: Option<PathBuf>,
    #[arg(long, global = true, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,
    #[arg(long, global = true)]
    pub step_limit: Option<u32>,
    /// Use single-shot completions instead of streaming.
    #[arg(long, global = true)]
    pub no_stream: bool,
}

impl QuillConfig {
    /// Read `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply command-line overrides, then settle `[model]` into the engine
    /// configuration.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(provider) = overrides.provider {
            self.model.provider = provider;
        }
        if let Some(model) = overrides.model {
            self.model.options.model = model;
        }
        if let Some(region) = overrides.region {
            self.model.options.region = region;
        }
        if let Some(path) = overrides.db_path {
            self.store.path = path;
        }
        if let Some(key) = overrides.anthropic_api_key {
            self.model.api_key = Some(SecretString::from(key));
        }
        if let Some(limit) = overrides.step_limit {
            self.engine.step_limit = limit;
        }
        if overrides.no_stream {
            self.model.options.streaming = false;
        }
        self.engine.model = self.model.options.clone();
    }

    /// Reject settings that would make every request fail.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.engine.step_limit >= 1,
            "[engine] step_limit must be at least 1, got {}",
            self.engine.step_limit
        );
        Ok(())
    }
}

fn quill_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".quill")
}
