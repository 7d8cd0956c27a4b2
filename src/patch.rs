//! Model block patches
//!
//! [`ModelPatcher`] is a cheaply cloneable model handle carrying lists of
//! hooks that a UNet forward pass runs around its input and output blocks:
//!
//! ```text
//! input block i:   h = block(h)
//!                  h = input_block_patch(h)              (each, in order)
//!                  skip_i = h
//!                  h = input_block_patch_after_skip(h)   (each, in order)
//! output block j:  hsp = pop skip
//!                  (h, hsp) = output_block_patch(h, hsp) (each, in order)
//!                  h = cat([h, hsp], dim 1)
//! ```

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, IndexOp, Result, Tensor};
use tracing::debug;

use crate::resize::{bicubic_scale, bicubic_to_size};
use crate::scale_curve::{ScaleCurve, SigmaScaleResolver};
use crate::schedule::SamplingSchedule;

/// Which part of the UNet a block belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Input,
    Middle,
    Output,
}

/// Block currently being evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub kind: BlockKind,
    pub index: usize,
}

impl BlockId {
    pub fn input(index: usize) -> Self {
        Self {
            kind: BlockKind::Input,
            index,
        }
    }

    pub fn middle(index: usize) -> Self {
        Self {
            kind: BlockKind::Middle,
            index,
        }
    }

    pub fn output(index: usize) -> Self {
        Self {
            kind: BlockKind::Output,
            index,
        }
    }
}

/// Per-call state handed to patches
#[derive(Debug, Clone)]
pub struct PatchContext {
    pub block: BlockId,
    /// Noise levels of the current step, one per batch entry.
    pub sigmas: Tensor,
}

impl PatchContext {
    pub fn new(block: BlockId, sigmas: Tensor) -> Self {
        Self { block, sigmas }
    }

    /// Noise level of the first batch entry.
    pub fn sigma(&self) -> Result<f64> {
        let sigmas = self.sigmas.flatten_all()?;
        sigmas.i(0)?.to_dtype(DType::F64)?.to_scalar::<f64>()
    }
}

/// Hook run on the hidden state of an input block
pub trait InputBlockPatch: Send + Sync {
    fn apply(&self, h: Tensor, ctx: &PatchContext) -> Result<Tensor>;
}

/// Hook run on an output block's hidden state and its skip connection
pub trait OutputBlockPatch: Send + Sync {
    fn apply(&self, h: Tensor, hsp: Tensor, ctx: &PatchContext) -> Result<(Tensor, Tensor)>;
}

/// Where an input patch runs relative to the skip-connection capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchPlacement {
    /// Before the skip is captured; the skip sees the patched tensor.
    BeforeSkip,
    /// After the skip is captured; only the main path is patched.
    #[default]
    AfterSkip,
}

impl PatchPlacement {
    pub fn from_after_skip(after_skip: bool) -> Self {
        if after_skip {
            Self::AfterSkip
        } else {
            Self::BeforeSkip
        }
    }
}

/// Hook lists attached to a model handle
#[derive(Clone, Default)]
pub struct ModelOptions {
    input_block_patch: Vec<Arc<dyn InputBlockPatch>>,
    input_block_patch_after_skip: Vec<Arc<dyn InputBlockPatch>>,
    output_block_patch: Vec<Arc<dyn OutputBlockPatch>>,
}

impl ModelOptions {
    pub fn input_block_patches(&self) -> usize {
        self.input_block_patch.len()
    }

    pub fn input_block_patches_after_skip(&self) -> usize {
        self.input_block_patch_after_skip.len()
    }

    pub fn output_block_patches(&self) -> usize {
        self.output_block_patch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_block_patch.is_empty()
            && self.input_block_patch_after_skip.is_empty()
            && self.output_block_patch.is_empty()
    }
}

impl fmt::Debug for ModelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelOptions")
            .field("input_block_patch", &self.input_block_patches())
            .field(
                "input_block_patch_after_skip",
                &self.input_block_patches_after_skip(),
            )
            .field("output_block_patch", &self.output_block_patches())
            .finish()
    }
}

/// Model handle plus the patches to apply during its forward pass.
///
/// Cloning shares the model and sampling schedule and copies the hook lists,
/// so patching a clone leaves the original untouched.
pub struct ModelPatcher<M> {
    model: Arc<M>,
    sampling: Arc<dyn SamplingSchedule>,
    options: ModelOptions,
}

impl<M> Clone for ModelPatcher<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            sampling: Arc::clone(&self.sampling),
            options: self.options.clone(),
        }
    }
}

impl<M> fmt::Debug for ModelPatcher<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPatcher")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<M> ModelPatcher<M> {
    pub fn new(model: M, sampling: Arc<dyn SamplingSchedule>) -> Self {
        Self {
            model: Arc::new(model),
            sampling,
            options: ModelOptions::default(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_sampling(&self) -> &dyn SamplingSchedule {
        self.sampling.as_ref()
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// True if both handles wrap the same model instance.
    pub fn is_clone(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.model, &other.model)
    }

    pub fn set_model_input_block_patch(&mut self, patch: Arc<dyn InputBlockPatch>) {
        self.options.input_block_patch.push(patch);
    }

    pub fn set_model_input_block_patch_after_skip(&mut self, patch: Arc<dyn InputBlockPatch>) {
        self.options.input_block_patch_after_skip.push(patch);
    }

    pub fn set_model_output_block_patch(&mut self, patch: Arc<dyn OutputBlockPatch>) {
        self.options.output_block_patch.push(patch);
    }

    /// Install an input patch at the given placement.
    pub fn set_input_patch(&mut self, patch: Arc<dyn InputBlockPatch>, placement: PatchPlacement) {
        match placement {
            PatchPlacement::BeforeSkip => self.set_model_input_block_patch(patch),
            PatchPlacement::AfterSkip => self.set_model_input_block_patch_after_skip(patch),
        }
    }

    /// Run input patches on an input block's output.
    ///
    /// Returns the hidden state to feed the next block and the tensor to keep
    /// as that block's skip connection.
    pub fn apply_input_block_patches(
        &self,
        mut h: Tensor,
        ctx: &PatchContext,
    ) -> Result<(Tensor, Tensor)> {
        for patch in &self.options.input_block_patch {
            h = patch.apply(h, ctx)?;
        }
        let skip = h.clone();
        for patch in &self.options.input_block_patch_after_skip {
            h = patch.apply(h, ctx)?;
        }
        Ok((h, skip))
    }

    /// Run output patches before an output block concatenates its skip.
    pub fn apply_output_block_patches(
        &self,
        mut h: Tensor,
        mut hsp: Tensor,
        ctx: &PatchContext,
    ) -> Result<(Tensor, Tensor)> {
        for patch in &self.options.output_block_patch {
            (h, hsp) = patch.apply(h, hsp, ctx)?;
        }
        Ok((h, hsp))
    }
}

/// Resizes the hidden state entering one input block by a sigma-dependent
/// scale factor.
#[derive(Debug)]
pub struct DownscaleInputPatch<C> {
    block_number: usize,
    resolver: SigmaScaleResolver<C>,
}

impl<C: ScaleCurve> DownscaleInputPatch<C> {
    pub fn new(block_number: usize, resolver: SigmaScaleResolver<C>) -> Self {
        Self {
            block_number,
            resolver,
        }
    }

    pub fn block_number(&self) -> usize {
        self.block_number
    }

    pub fn resolver(&self) -> &SigmaScaleResolver<C> {
        &self.resolver
    }
}

impl<C: ScaleCurve> InputBlockPatch for DownscaleInputPatch<C> {
    fn apply(&self, h: Tensor, ctx: &PatchContext) -> Result<Tensor> {
        if ctx.block != BlockId::input(self.block_number) {
            return Ok(h);
        }
        let sigma = ctx.sigma()?;
        let scale = self.resolver.resolve(sigma);
        debug!(block = self.block_number, sigma, scale, "deep shrink input resize");
        bicubic_scale(&h, scale)
    }
}

/// Resizes an output block's hidden state back to its skip connection's
/// spatial size when the heights differ.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchSkipOutputPatch;

impl OutputBlockPatch for MatchSkipOutputPatch {
    fn apply(&self, h: Tensor, hsp: Tensor, _ctx: &PatchContext) -> Result<(Tensor, Tensor)> {
        let (_, _, h_height, _) = h.dims4()?;
        let (_, _, skip_height, skip_width) = hsp.dims4()?;
        if h_height == skip_height {
            return Ok((h, hsp));
        }
        let h = bicubic_to_size(&h, skip_height, skip_width)?;
        Ok((h, hsp))
    }
}

/// Clone `model` and install the deep shrink hook pair.
pub fn install_deep_shrink<M, C>(
    model: &ModelPatcher<M>,
    block_number: usize,
    curve: C,
    placement: PatchPlacement,
) -> ModelPatcher<M>
where
    C: ScaleCurve + 'static,
{
    let resolver = SigmaScaleResolver::new(curve, model.model_sampling());
    let mut patched = model.clone();
    patched.set_input_patch(
        Arc::new(DownscaleInputPatch::new(block_number, resolver)),
        placement,
    );
    patched.set_model_output_block_patch(Arc::new(MatchSkipOutputPatch));
    debug!(block_number, ?placement, "installed deep shrink patches");
    patched
}
