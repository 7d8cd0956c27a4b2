//! Deep-Shrink: Kohya Deep Shrink block patches for candle diffusion UNets.
//!
//! The patches downscale the hidden state entering one UNet input block while
//! the noise level is high and resize the matching output block back to its
//! skip connection's size, which keeps high-resolution samples coherent.

pub mod config;
pub mod nodes;
pub mod patch;
pub mod resize;
pub mod scale_curve;
pub mod schedule;

pub use config::{BetaSchedule, ConfigError, DeepShrinkConfig, ModelSamplingConfig, NodeConfig};
pub use nodes::{
    GradientPatchModelAddDownscale, GradientPatchModelAddDownscaleAdvanced, NodeDefinition,
    NodeError, node_definitions,
};
pub use patch::{
    BlockId, BlockKind, DownscaleInputPatch, InputBlockPatch, MatchSkipOutputPatch, ModelPatcher,
    OutputBlockPatch, PatchContext, PatchPlacement, install_deep_shrink,
};
pub use resize::{ResizeTarget, bicubic, bicubic_scale, bicubic_to_size};
pub use scale_curve::{
    CurveParseError, LinearRamp, PiecewiseCurve, ScaleCurve, SigmaScaleResolver,
};
pub use schedule::{DiscreteModelSampling, FnSchedule, SamplingSchedule, SigmaSamples};
