//! Bicubic resize for NCHW feature maps
//!
//! Matches `interpolate(mode="bicubic", align_corners=False)`: Keys cubic
//! kernel with A = -0.75, half-pixel source coordinates and clamped border
//! reads. The resize is separable, so it runs as two matmuls against
//! `[out, in]` weight matrices and works on any device candle supports.

use candle_core::{DType, Device, Result, Tensor};

const CUBIC_A: f64 = -0.75;
/// Largest per-axis weight matrix (`out_len * in_len` entries) a resize builds.
const MAX_WEIGHTS: usize = 1 << 31;

/// Target of a resize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResizeTarget {
    /// Multiply height and width by this factor (output = floor(in * factor)).
    Scale(f64),
    /// Resize to exactly `(height, width)`.
    Size(usize, usize),
}

fn cubic_near(x: f64) -> f64 {
    ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
}

fn cubic_far(x: f64) -> f64 {
    ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
}

/// Row-major `[out_len, in_len]` matrix mapping input samples to output samples.
///
/// `src_per_dst` is the source step per output pixel.
fn cubic_weights(in_len: usize, out_len: usize, src_per_dst: f64) -> Result<Vec<f32>> {
    let len = match out_len.checked_mul(in_len) {
        Some(len) if len <= MAX_WEIGHTS => len,
        _ => candle_core::bail!("bicubic resize {in_len} -> {out_len} is too large"),
    };
    let mut weights = vec![0f32; len];
    let last = in_len as i64 - 1;
    for o in 0..out_len {
        let src = src_per_dst * (o as f64 + 0.5) - 0.5;
        let base = src.floor();
        let t = src - base;
        let taps = [
            cubic_far(t + 1.0),
            cubic_near(t),
            cubic_near(1.0 - t),
            cubic_far(2.0 - t),
        ];
        let row = &mut weights[o * in_len..(o + 1) * in_len];
        for (k, w) in taps.iter().enumerate() {
            let idx = (base as i64 - 1 + k as i64).clamp(0, last) as usize;
            row[idx] += *w as f32;
        }
    }
    Ok(weights)
}

fn weight_matrix(
    in_len: usize,
    out_len: usize,
    src_per_dst: f64,
    transpose: bool,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let w = Tensor::from_vec(cubic_weights(in_len, out_len, src_per_dst)?, (out_len, in_len), device)?;
    let w = if transpose { w.t()?.contiguous()? } else { w };
    w.to_dtype(dtype)
}

/// Output size for a scale-factor resize.
///
/// `None` when `scale` is not a positive finite number or the result does not
/// fit in a `usize`.
pub fn scaled_size(len: usize, scale: f64) -> Option<usize> {
    if !scale.is_finite() || scale <= 0.0 {
        return None;
    }
    let size = (len as f64 * scale).floor();
    (size < usize::MAX as f64).then_some(size as usize)
}

/// Bicubic resize of the last two dims of a rank-4 `[B, C, H, W]` tensor.
pub fn bicubic(x: &Tensor, target: ResizeTarget) -> Result<Tensor> {
    let (_b, _c, in_h, in_w) = x.dims4()?;
    let (out_h, out_w, step_h, step_w) = match target {
        ResizeTarget::Scale(scale) => {
            let (Some(out_h), Some(out_w)) = (scaled_size(in_h, scale), scaled_size(in_w, scale))
            else {
                candle_core::bail!("invalid bicubic scale factor {scale} for {in_h}x{in_w}");
            };
            (out_h, out_w, 1.0 / scale, 1.0 / scale)
        }
        ResizeTarget::Size(h, w) => (h, w, in_h as f64 / h as f64, in_w as f64 / w as f64),
    };
    if out_h == 0 || out_w == 0 {
        candle_core::bail!(
            "bicubic resize of {in_h}x{in_w} with {target:?} gives an empty output"
        );
    }
    if out_h == in_h && out_w == in_w && step_h == 1.0 && step_w == 1.0 {
        return Ok(x.clone());
    }

    let dtype = x.dtype();
    let device = x.device();
    let rows = weight_matrix(in_h, out_h, step_h, false, dtype, device)?;
    let cols = weight_matrix(in_w, out_w, step_w, true, dtype, device)?;

    // [out_h, H] x [B, C, H, W] -> [B, C, out_h, W]
    let h = rows.broadcast_matmul(&x.contiguous()?)?;
    // [B, C, out_h, W] x [W, out_w] -> [B, C, out_h, out_w]
    h.broadcast_matmul(&cols)
}

/// Resize by a scale factor.
pub fn bicubic_scale(x: &Tensor, scale: f64) -> Result<Tensor> {
    bicubic(x, ResizeTarget::Scale(scale))
}

/// Resize to an explicit `(height, width)`.
pub fn bicubic_to_size(x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    bicubic(x, ResizeTarget::Size(height, width))
}
