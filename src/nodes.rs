//! Deep shrink nodes
//!
//! Two node types patch a model so that the feature map entering one input
//! block is downscaled early in sampling and restored to full size later:
//!
//! - [`GradientPatchModelAddDownscale`]: linear ramp from `1 / downscale_factor` at
//!   `start_percent` to `1.0` at `end_percent`.
//! - [`GradientPatchModelAddDownscaleAdvanced`]: arbitrary `(percent, scale)` curve
//!   given as text.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::patch::{ModelPatcher, PatchPlacement, install_deep_shrink};
use crate::scale_curve::{CurveParseError, LinearRamp, PiecewiseCurve};

pub const BLOCK_NUMBER_RANGE: RangeInclusive<u32> = 1..=32;
pub const DOWNSCALE_FACTOR_RANGE: RangeInclusive<f64> = 0.1..=9.0;
pub const PERCENT_RANGE: RangeInclusive<f64> = 0.0..=1.0;

pub const CATEGORY: &str = "_for_testing";
pub const DEFAULT_CURVE_CONFIG: &str = "0 0.5\n1 1";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid deep shrink config")]
    Config(#[from] CurveParseError),
}

/// Linear deep shrink node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientPatchModelAddDownscale {
    pub block_number: u32,
    pub downscale_factor: f64,
    pub start_percent: f64,
    pub end_percent: f64,
    pub downscale_after_skip: bool,
}

impl Default for GradientPatchModelAddDownscale {
    fn default() -> Self {
        Self {
            block_number: 3,
            downscale_factor: 2.0,
            start_percent: 0.0,
            end_percent: 0.35,
            downscale_after_skip: true,
        }
    }
}

impl GradientPatchModelAddDownscale {
    pub const CLASS_NAME: &'static str = "GradientPatchModelAddDownscale";
    pub const DISPLAY_NAME: &'static str = "GradientPatchModelAddDownscale (Kohya Deep Shrink)";

    pub fn curve(&self) -> LinearRamp {
        LinearRamp::new(self.start_percent, self.end_percent, self.downscale_factor)
    }

    /// Clone `model` with the deep shrink patches installed.
    pub fn patch<M>(&self, model: &ModelPatcher<M>) -> ModelPatcher<M> {
        install_deep_shrink(
            model,
            self.block_number as usize,
            self.curve(),
            PatchPlacement::from_after_skip(self.downscale_after_skip),
        )
    }
}

/// Curve-driven deep shrink node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientPatchModelAddDownscaleAdvanced {
    pub block_number: u32,
    pub downscale_after_skip: bool,
    pub interpolate: bool,
    /// One `"<percent> <scale>"` pair per line.
    pub config: String,
}

impl Default for GradientPatchModelAddDownscaleAdvanced {
    fn default() -> Self {
        Self {
            block_number: 3,
            downscale_after_skip: true,
            interpolate: true,
            config: DEFAULT_CURVE_CONFIG.to_string(),
        }
    }
}

impl GradientPatchModelAddDownscaleAdvanced {
    pub const CLASS_NAME: &'static str = "GradientPatchModelAddDownscaleAdvanced";
    pub const DISPLAY_NAME: &'static str = "GradientPatchModelAddDownscaleAdvanced (Kohya Deep Shrink)";

    pub fn curve(&self) -> Result<PiecewiseCurve, CurveParseError> {
        PiecewiseCurve::parse(&self.config, self.interpolate)
    }

    /// Clone `model` with the deep shrink patches installed.
    ///
    /// Fails without touching `model` if the curve text is malformed.
    pub fn patch<M>(&self, model: &ModelPatcher<M>) -> Result<ModelPatcher<M>, NodeError> {
        let curve = self.curve()?;
        Ok(install_deep_shrink(
            model,
            self.block_number as usize,
            curve,
            PatchPlacement::from_after_skip(self.downscale_after_skip),
        ))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Widget description of one node input
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum InputSpec {
    Model,
    Int {
        default: u32,
        min: u32,
        max: u32,
        step: u32,
    },
    Float {
        default: f64,
        min: f64,
        max: f64,
        step: f64,
    },
    Boolean {
        default: bool,
    },
    String {
        default: &'static str,
        multiline: bool,
    },
}

/// Registration record for a node type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDefinition {
    pub class_name: &'static str,
    pub display_name: &'static str,
    pub category: &'static str,
    pub inputs: Vec<(&'static str, InputSpec)>,
    pub outputs: Vec<&'static str>,
}

fn block_number_input() -> (&'static str, InputSpec) {
    (
        "block_number",
        InputSpec::Int {
            default: 3,
            min: *BLOCK_NUMBER_RANGE.start(),
            max: *BLOCK_NUMBER_RANGE.end(),
            step: 1,
        },
    )
}

fn percent_input(name: &'static str, default: f64) -> (&'static str, InputSpec) {
    (
        name,
        InputSpec::Float {
            default,
            min: *PERCENT_RANGE.start(),
            max: *PERCENT_RANGE.end(),
            step: 0.001,
        },
    )
}

/// Definitions of every node this crate provides.
pub fn node_definitions() -> Vec<NodeDefinition> {
    let basic = GradientPatchModelAddDownscale::default();
    let advanced = GradientPatchModelAddDownscaleAdvanced::default();
    vec![
        NodeDefinition {
            class_name: GradientPatchModelAddDownscale::CLASS_NAME,
            display_name: GradientPatchModelAddDownscale::DISPLAY_NAME,
            category: CATEGORY,
            inputs: vec![
                ("model", InputSpec::Model),
                block_number_input(),
                (
                    "downscale_factor",
                    InputSpec::Float {
                        default: basic.downscale_factor,
                        min: *DOWNSCALE_FACTOR_RANGE.start(),
                        max: *DOWNSCALE_FACTOR_RANGE.end(),
                        step: 0.001,
                    },
                ),
                percent_input("start_percent", basic.start_percent),
                percent_input("end_percent", basic.end_percent),
                (
                    "downscale_after_skip",
                    InputSpec::Boolean {
                        default: basic.downscale_after_skip,
                    },
                ),
            ],
            outputs: vec!["MODEL"],
        },
        NodeDefinition {
            class_name: GradientPatchModelAddDownscaleAdvanced::CLASS_NAME,
            display_name: GradientPatchModelAddDownscaleAdvanced::DISPLAY_NAME,
            category: CATEGORY,
            inputs: vec![
                ("model", InputSpec::Model),
                block_number_input(),
                (
                    "downscale_after_skip",
                    InputSpec::Boolean {
                        default: advanced.downscale_after_skip,
                    },
                ),
                (
                    "interpolate",
                    InputSpec::Boolean {
                        default: advanced.interpolate,
                    },
                ),
                (
                    "config",
                    InputSpec::String {
                        default: DEFAULT_CURVE_CONFIG,
                        multiline: true,
                    },
                ),
            ],
            outputs: vec!["MODEL"],
        },
    ]
}

/// Look up a node definition by class name.
pub fn find_node(class_name: &str) -> Option<NodeDefinition> {
    node_definitions()
        .into_iter()
        .find(|def| def.class_name == class_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names() {
        let defs = node_definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].class_name, "GradientPatchModelAddDownscale");
        assert_eq!(
            defs[1].display_name,
            "GradientPatchModelAddDownscaleAdvanced (Kohya Deep Shrink)"
        );
        assert!(defs.iter().all(|d| d.category == "_for_testing"));
        assert!(defs.iter().all(|d| d.outputs == vec!["MODEL"]));
    }

    #[test]
    fn test_find_node() {
        let def = find_node("GradientPatchModelAddDownscaleAdvanced").unwrap();
        let names: Vec<&str> = def.inputs.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            ["model", "block_number", "downscale_after_skip", "interpolate", "config"]
        );
        assert!(find_node("PatchModelAddNoise").is_none());
    }

    #[test]
    fn test_definition_json_shape() {
        let def = find_node("GradientPatchModelAddDownscale").unwrap();
        let json = serde_json::to_value(&def).unwrap();
        let factor = &json["inputs"][2];
        assert_eq!(factor[0], "downscale_factor");
        assert_eq!(factor[1]["type"], "FLOAT");
        assert_eq!(factor[1]["min"], 0.1);
        assert_eq!(factor[1]["max"], 9.0);
        assert_eq!(json["inputs"][1][1]["max"], 32);
    }

    #[test]
    fn test_basic_curve_from_inputs() {
        let node = GradientPatchModelAddDownscale {
            downscale_factor: 4.0,
            start_percent: 0.1,
            end_percent: 0.5,
            ..Default::default()
        };
        assert_eq!(node.curve(), LinearRamp::new(0.1, 0.5, 4.0));
    }

    #[test]
    fn test_advanced_default_curve() {
        let curve = GradientPatchModelAddDownscaleAdvanced::default().curve().unwrap();
        assert_eq!(curve.points(), &[(0.0, 0.5), (1.0, 1.0)]);
    }
}
