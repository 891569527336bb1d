use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;
use crate::stream::TokenStream;

pub const DEFAULT_MODEL: &str = "anthropic.claude-3-sonnet-20240229-v1:0";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Options controlling a single model call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Backing foundation model identifier.
    pub model: String,
    /// Region or endpoint the model is served from.
    pub region: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Selects the `stream` path (true) or the `complete` path (false).
    pub streaming: bool,
    /// Bounds `complete` end to end and `stream` between consecutive events.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub stop_sequences: Vec<String>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            region: DEFAULT_REGION.to_string(),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            temperature: None,
            streaming: true,
            timeout: DEFAULT_TIMEOUT,
            stop_sequences: Vec::new(),
        }
    }
}

/// Abstraction over the foundation model endpoint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    /// Generate the full completion for `prompt`.
    async fn complete(&self, prompt: &str, options: &ModelOptions) -> Result<String, ModelError>;

    /// Start a streamed generation for `prompt`.
    async fn stream(&self, prompt: &str, options: &ModelOptions) -> Result<TokenStream, ModelError>;
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
