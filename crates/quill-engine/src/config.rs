use serde::{Deserialize, Serialize};

use quill_core::model::ModelOptions;
use quill_core::transport::FrameFormat;

use crate::truncate::DEFAULT_MAX_OBSERVATION;

pub const DEFAULT_STEP_LIMIT: u32 = 8;

/// Configuration for the agent runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of generations per request.
    pub step_limit: u32,
    pub model: ModelOptions,
    pub frame_format: FrameFormat,
    /// Observations longer than this are cut before they reach the prompt.
    pub max_observation_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_limit: DEFAULT_STEP_LIMIT,
            model: ModelOptions::default(),
            frame_format: FrameFormat::default(),
            max_observation_bytes: DEFAULT_MAX_OBSERVATION,
        }
    }
}
