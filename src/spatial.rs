// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-sequence to spatial-grid reshaping.
//!
//! Self-attention inside a U-Net sees the latent as a flattened token
//! sequence `[batch, area, channels]`. To filter it spatially the grid has
//! to be recovered from `area` and the aspect ratio of the original latent:
//! the shorter side is rounded from `sqrt`, and the longer side is derived
//! by exact division.

use candle_core::{D, Tensor};

use crate::error::{PagError, Result};

/// Recover `(height, width)` of a flattened grid of `area` tokens.
///
/// For `aspect_ratio >= 1` the height is `round(sqrt(area / aspect_ratio))`
/// and the width is `area / height`; otherwise the width is
/// `round(sqrt(area * aspect_ratio))` and the height is `area / width`.
/// Rounding is half-to-even.
///
/// ```
/// use candle_pag::spatial::infer_spatial_dims;
///
/// assert_eq!(infer_spatial_dims(8, 2.0).unwrap(), (2, 4));
/// assert_eq!(infer_spatial_dims(8, 0.5).unwrap(), (4, 2));
/// ```
///
/// # Errors
///
/// Returns [`PagError::DegenerateShape`] if the aspect ratio is not a
/// positive finite number, if the rounded side is zero, or if `area` does
/// not factor into the derived grid.
pub fn infer_spatial_dims(area: usize, aspect_ratio: f64) -> Result<(usize, usize)> {
    if !(aspect_ratio.is_finite() && aspect_ratio > 0.0) {
        return Err(PagError::DegenerateShape(format!(
            "aspect ratio {aspect_ratio} is not positive"
        )));
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::as_conversions
    )]
    let rounded_side = |x: f64| x.sqrt().round_ties_even() as usize;
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let area_f = area as f64;

    let (height, width) = if aspect_ratio >= 1.0 {
        let height = rounded_side(area_f / aspect_ratio);
        if height == 0 {
            return Err(PagError::DegenerateShape(format!(
                "{area} tokens at aspect ratio {aspect_ratio} give zero height"
            )));
        }
        (height, area / height)
    } else {
        let width = rounded_side(area_f * aspect_ratio);
        if width == 0 {
            return Err(PagError::DegenerateShape(format!(
                "{area} tokens at aspect ratio {aspect_ratio} give zero width"
            )));
        }
        (area / width, width)
    };

    if height == 0 || width == 0 || height * width != area {
        return Err(PagError::DegenerateShape(format!(
            "{area} tokens do not factor into a {height}x{width} grid"
        )));
    }
    Ok((height, width))
}

/// Rearrange `[batch, area, channels]` into `[batch, channels, height, width]`.
///
/// # Errors
///
/// Returns [`PagError::Model`] if `height * width` does not match `area`.
pub fn to_spatial(tokens: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (batch, _area, channels) = tokens.dims3()?;
    // CONTIGUOUS: transpose produces non-unit strides; reshape needs a dense layout
    Ok(tokens
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, channels, height, width))?)
}

/// Rearrange `[batch, channels, height, width]` back into `[batch, area, channels]`.
///
/// # Errors
///
/// Returns [`PagError::Model`] if `grid` is not 4D.
pub fn from_spatial(grid: &Tensor) -> Result<Tensor> {
    let (batch, channels, height, width) = grid.dims4()?;
    Ok(grid
        .contiguous()?
        .reshape((batch, channels, height * width))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// Replace every spatial position with the per-`(batch, channel)` mean.
///
/// Returns a new tensor; the input is left untouched.
///
/// # Shapes
/// - `grid`: `[batch, channels, height, width]`
/// - returns: same shape, constant over the last two axes
///
/// # Errors
///
/// Returns [`PagError::Model`] on tensor operation failures.
pub fn spatial_mean(grid: &Tensor) -> Result<Tensor> {
    Ok(grid
        .mean_keepdim(D::Minus1)?
        .mean_keepdim(D::Minus2)?
        .broadcast_as(grid.shape())?
        .contiguous()?)
}

/// Gaussian kernel size for `sigma`, capped for a `height x width` grid.
///
/// The uncapped size is `ceil(6 * sigma)` bumped to the next odd number.
/// The cap `2 * min(height, width) - 1` keeps the padding (`kernel / 2`)
/// within one reflection of the grid. The result is always odd.
#[must_use]
pub fn kernel_size_for_sigma(sigma: f64, height: usize, width: usize) -> usize {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::as_conversions
    )]
    let mut kernel_size = (6.0 * sigma).ceil() as usize;
    if kernel_size % 2 == 0 {
        kernel_size = kernel_size.saturating_add(1);
    }
    let max_kernel = (2 * height.min(width)).saturating_sub(1).max(1);
    kernel_size.min(max_kernel)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
