use std::str::FromStr;

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "quill_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// Log to stderr, keeping stdout free for answers.
    pub stderr: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            stderr: false,
        }
    }
}

/// `[logging]` section of the config file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub json: Option<bool>,
    pub modules: Vec<ModuleLevel>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModuleLevel {
    pub module: String,
    pub level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown log level `{0}`")]
    UnknownLevel(String),
    #[error("failed to install subscriber: {0}")]
    Init(String),
}

impl TelemetryConfig {
    pub fn from_section(section: &LoggingSection) -> Result<Self, TelemetryError> {
        let mut config = Self::default();
        if let Some(level) = &section.level {
            config.log_level = parse_level(level)?;
        }
        if let Some(json) = section.json {
            config.json = json;
        }
        for m in &section.modules {
            config.module_levels.push((m.module.clone(), parse_level(&m.level)?));
        }
        Ok(config)
    }

    /// EnvFilter directive string, e.g. `info,quill_engine=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

pub fn parse_level(s: &str) -> Result<Level, TelemetryError> {
    Level::from_str(s.trim()).map_err(|_| TelemetryError::UnknownLevel(s.to_string()))
}

/// Initialize the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = match (config.json, config.stderr) {
        (true, false) => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed(),
        (true, true) => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed(),
        (false, false) => tracing_subscriber::fmt::layer().with_target(true).boxed(),
        (false, true) => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}
