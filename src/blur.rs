// SPDX-License-Identifier: MIT OR Apache-2.0

//! Separable 2D Gaussian blur with configurable border handling.
//!
//! The blur runs on `[batch, channels, height, width]` tensors. Each axis is
//! padded by `kernel_size / 2` according to a [`BorderMode`] and then
//! filtered with a normalized 1D Gaussian, height first, then width.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor};

use crate::error::{PagError, Result};

// ---------------------------------------------------------------------------
// BorderMode
// ---------------------------------------------------------------------------

/// How out-of-bounds samples are synthesized when padding before the blur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BorderMode {
    /// Mirror without repeating the edge sample: `dcb|abcd|cba`.
    #[default]
    Reflect,
    /// Repeat the edge sample: `aaa|abcd|ddd`.
    Replicate,
    /// Pad with zeros.
    Constant,
    /// Wrap around: `bcd|abcd|abc`.
    Circular,
}

impl fmt::Display for BorderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reflect => write!(f, "reflect"),
            Self::Replicate => write!(f, "replicate"),
            Self::Constant => write!(f, "constant"),
            Self::Circular => write!(f, "circular"),
        }
    }
}

impl FromStr for BorderMode {
    type Err = PagError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reflect" => Ok(Self::Reflect),
            "replicate" => Ok(Self::Replicate),
            "constant" => Ok(Self::Constant),
            "circular" => Ok(Self::Circular),
            other => Err(PagError::Config(format!(
                "unknown border mode '{other}' (expected reflect, replicate, constant or circular)"
            ))),
        }
    }
}

impl BorderMode {
    /// Largest padding this mode supports on an axis of length `len`.
    const fn max_padding(self, len: usize) -> usize {
        match self {
            Self::Reflect => len.saturating_sub(1),
            Self::Circular => len,
            Self::Replicate | Self::Constant => usize::MAX,
        }
    }

    /// Source index for padded position `pos` (relative to the unpadded axis).
    ///
    /// Only called with `pos` within `max_padding` of a non-empty axis.
    #[allow(
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::as_conversions
    )]
    fn source_index(self, pos: isize, len: usize) -> usize {
        let last = len as isize - 1;
        let src = match self {
            Self::Reflect => {
                if pos < 0 {
                    -pos
                } else if pos > last {
                    2 * last - pos
                } else {
                    pos
                }
            }
            Self::Replicate | Self::Constant => pos,
            Self::Circular => pos.rem_euclid(len as isize),
        };
        src.clamp(0, last) as usize
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Normalized 1D Gaussian weights of odd length `kernel_size`.
///
/// Weights are `exp(-x^2 / (2 sigma^2))` for `x` centred on the middle tap,
/// divided by their sum.
///
/// # Errors
///
/// Returns [`PagError::Config`] if `kernel_size` is even or zero, or if
/// `sigma` is not strictly positive.
pub fn gaussian_kernel1d(kernel_size: usize, sigma: f64) -> Result<Vec<f32>> {
    if kernel_size % 2 == 0 {
        return Err(PagError::Config(format!(
            "gaussian kernel size must be odd, got {kernel_size}"
        )));
    }
    if !(sigma > 0.0 && sigma.is_finite()) {
        return Err(PagError::Config(format!(
            "gaussian sigma must be positive, got {sigma}"
        )));
    }
    let half = kernel_size / 2;
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let raw: Vec<f64> = (0..kernel_size)
        .map(|i| {
            let x = i as f64 - half as f64;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f64 = raw.iter().sum();
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let weights = raw.iter().map(|w| (w / total) as f32).collect();
    Ok(weights)
}

// ---------------------------------------------------------------------------
// Blur
// ---------------------------------------------------------------------------

/// Blur the last two axes of `x` with a `kernel_size x kernel_size` Gaussian.
///
/// Computed in F32 and cast back to the input dtype.
///
/// # Shapes
/// - `x`: `[batch, channels, height, width]`
/// - returns: same shape
///
/// # Errors
///
/// Returns [`PagError::Config`] if the kernel is invalid or needs more
/// padding than `border` can synthesize for the grid, and
/// [`PagError::Model`] on tensor operation failures.
pub fn gaussian_blur2d(
    x: &Tensor,
    kernel_size: usize,
    sigma: f64,
    border: BorderMode,
) -> Result<Tensor> {
    let (_batch, _channels, height, width) = x.dims4()?;
    let weights = gaussian_kernel1d(kernel_size, sigma)?;
    if height == 0 || width == 0 {
        return Ok(x.clone());
    }
    let pad = kernel_size / 2;
    for (axis, len) in [("height", height), ("width", width)] {
        if pad > border.max_padding(len) {
            return Err(PagError::Config(format!(
                "kernel size {kernel_size} needs padding {pad}, more than {border} \
                 border mode supports for {axis} {len}"
            )));
        }
    }

    // PROMOTE: accumulate the weighted sum in F32
    let dtype = x.dtype();
    let mut out = x.to_dtype(DType::F32)?;
    out = blur_axis(&out, 2, &weights, border)?;
    out = blur_axis(&out, 3, &weights, border)?;
    Ok(out.to_dtype(dtype)?)
}

/// Pad `x` by `pad` on both sides of `dim`.
fn pad_axis(x: &Tensor, dim: usize, pad: usize, border: BorderMode) -> Result<Tensor> {
    if pad == 0 {
        return Ok(x.clone());
    }
    if border == BorderMode::Constant {
        return Ok(x.pad_with_zeros(dim, pad, pad)?);
    }
    let len = x.dim(dim)?;
    let indices = padded_indices(len, pad, border)?;
    let indices = Tensor::from_vec(indices, len + 2 * pad, x.device())?;
    // CONTIGUOUS: index_select gathers from a dense layout
    Ok(x.contiguous()?.index_select(&indices, dim)?)
}

/// Gather indices for an axis of length `len` padded by `pad` on both sides.
fn padded_indices(len: usize, pad: usize, border: BorderMode) -> Result<Vec<u32>> {
    #[allow(clippy::cast_possible_wrap, clippy::as_conversions)]
    let (len_i, pad_i) = (len as isize, pad as isize);
    (-pad_i..len_i + pad_i)
        .map(|pos| {
            let src = border.source_index(pos, len);
            u32::try_from(src)
                .map_err(|_| PagError::Config(format!("axis length {len} overflows u32")))
        })
        .collect()
}

/// Convolve `x` along `dim` with `weights` (odd length, centred).
fn blur_axis(x: &Tensor, dim: usize, weights: &[f32], border: BorderMode) -> Result<Tensor> {
    let len = x.dim(dim)?;
    let padded = pad_axis(x, dim, weights.len() / 2, border)?;
    let mut acc = x.zeros_like()?;
    for (offset, weight) in weights.iter().enumerate() {
        let tap = padded.narrow(dim, offset, len)?.affine(f64::from(*weight), 0.0)?;
        acc = acc.add(&tap)?;
    }
    Ok(acc)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
