//! Configuration structures for deep shrink node invocations
//!
//! A config file describes the model sampling schedule and one node
//! invocation, e.g.
//!
//! ```json
//! {
//!   "sampling": { "beta_schedule": "scaled_linear" },
//!   "node": { "kind": "advanced", "block_number": 3, "config": "0 0.5\n1 1" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::nodes::{
    BLOCK_NUMBER_RANGE, DOWNSCALE_FACTOR_RANGE, PERCENT_RANGE, GradientPatchModelAddDownscale,
    GradientPatchModelAddDownscaleAdvanced,
};

/// Beta schedule used to derive training sigmas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
}

/// Discrete model sampling configuration (SD1.x defaults)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSamplingConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
}

impl Default for ModelSamplingConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
        }
    }
}

/// One node invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    Basic(GradientPatchModelAddDownscale),
    Advanced(GradientPatchModelAddDownscaleAdvanced),
}

impl NodeConfig {
    /// Checks the declared widget ranges of the node inputs.
    ///
    /// The nodes themselves accept any value; this is the host-side check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let block_number = match self {
            NodeConfig::Basic(node) => node.block_number,
            NodeConfig::Advanced(node) => node.block_number,
        };
        if !BLOCK_NUMBER_RANGE.contains(&block_number) {
            return Err(ConfigError::OutOfRange {
                field: "block_number",
                value: block_number as f64,
            });
        }

        if let NodeConfig::Basic(node) = self {
            let checks = [
                ("downscale_factor", node.downscale_factor, &DOWNSCALE_FACTOR_RANGE),
                ("start_percent", node.start_percent, &PERCENT_RANGE),
                ("end_percent", node.end_percent, &PERCENT_RANGE),
            ];
            for (field, value, range) in checks {
                if !range.contains(&value) {
                    return Err(ConfigError::OutOfRange { field, value });
                }
            }
        }
        Ok(())
    }
}

/// Top-level config file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepShrinkConfig {
    #[serde(default)]
    pub sampling: ModelSamplingConfig,
    pub node: NodeConfig,
}

impl DeepShrinkConfig {
    /// Parse and validate a JSON config.
    pub fn from_json(path: &str, contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(contents).map_err(|source| ConfigError::JsonParse {
                path: path.to_string(),
                source,
            })?;
        config.node.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: display.clone(),
            source,
        })?;
        Self::from_json(&display, &contents)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{field} = {value} is outside its allowed range")]
    OutOfRange { field: &'static str, value: f64 },
}
