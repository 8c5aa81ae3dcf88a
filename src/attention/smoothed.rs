// SPDX-License-Identifier: MIT OR Apache-2.0

//! Smoothed Energy Guidance: blur the query before attending.
//!
//! The query tokens are folded back onto the latent grid, filtered there,
//! and unfolded again before the wrapped attention runs:
//!
//! 1. `[batch, area, channels]` → `[batch, channels, height, width]`, with
//!    the grid recovered from `area` and the original aspect ratio.
//! 2. `blur_sigma >= 0`: Gaussian blur with kernel `ceil(6 sigma)` (odd),
//!    capped at `2 * min(height, width) - 1`. A capped kernel below 3 leaves
//!    `q` as is.
//!    `blur_sigma < 0`: every position takes the spatial mean.
//! 3. Back to `[batch, area, channels]`, then `attention(q, k, v, heads)`.
//!
//! `k` and `v` are never touched.

use std::sync::Arc;

use candle_core::Tensor;

use crate::blur::{BorderMode, gaussian_blur2d};
use crate::error::Result;
use crate::options::ExtraOptions;
use crate::spatial::{
    from_spatial, infer_spatial_dims, kernel_size_for_sigma, spatial_mean, to_spatial,
};

use super::{AttentionFn, AttentionOverride};

/// Smallest kernel worth blurring with.
const MIN_KERNEL_SIZE: usize = 3;

/// Attention decorator that spatially smooths `q` before delegating.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use candle_pag::{
///     AttentionOverride, BorderMode, ExtraOptions, ScaledDotProductAttention,
///     SmoothedEnergyAttention,
/// };
///
/// let seg = SmoothedEnergyAttention::new(ScaledDotProductAttention, 2.0, BorderMode::Reflect);
/// let q = Tensor::ones((1, 32, 8), DType::F32, &Device::Cpu).unwrap();
/// let opts = ExtraOptions::new().with_n_heads(2).with_original_shape(&[1, 4, 32, 64]);
/// let out = seg.forward(&q, &q, &q, &opts, None).unwrap();
/// assert_eq!(out.dims(), &[1, 32, 8]);
/// ```
#[derive(Debug, Clone)]
pub struct SmoothedEnergyAttention<A> {
    /// Wrapped attention function.
    attention: A,
    /// Blur sigma; negative selects mean collapse.
    blur_sigma: f64,
    /// Padding policy for the blur.
    border_mode: BorderMode,
}

impl<A: AttentionFn> SmoothedEnergyAttention<A> {
    /// Wrap `attention`.
    pub const fn new(attention: A, blur_sigma: f64, border_mode: BorderMode) -> Self {
        Self {
            attention,
            blur_sigma,
            border_mode,
        }
    }

    /// Configured blur sigma.
    #[must_use]
    pub const fn blur_sigma(&self) -> f64 {
        self.blur_sigma
    }

    /// Configured border mode.
    #[must_use]
    pub const fn border_mode(&self) -> BorderMode {
        self.border_mode
    }

    /// Return the smoothed query without running attention.
    ///
    /// # Shapes
    /// - `q`: `[batch, area, channels]`
    /// - returns: `[batch, area, channels]`
    ///
    /// # Errors
    ///
    /// Returns [`PagError::MissingOption`](crate::PagError::MissingOption)
    /// if `original_shape` is absent,
    /// [`PagError::DegenerateShape`](crate::PagError::DegenerateShape) if no
    /// grid can be derived, and [`PagError::Model`](crate::PagError::Model)
    /// on tensor operation failures.
    pub fn perturb_query(&self, q: &Tensor, options: &ExtraOptions) -> Result<Tensor> {
        let (_batch, area, _channels) = q.dims3()?;
        let aspect_ratio = options.aspect_ratio()?;
        let (height, width) = infer_spatial_dims(area, aspect_ratio)?;
        let grid = to_spatial(q, height, width)?;

        let grid = if self.blur_sigma >= 0.0 {
            let kernel_size = kernel_size_for_sigma(self.blur_sigma, height, width);
            if kernel_size >= MIN_KERNEL_SIZE {
                tracing::debug!(
                    height,
                    width,
                    kernel_size,
                    sigma = self.blur_sigma,
                    border = %self.border_mode,
                    "blurring query"
                );
                gaussian_blur2d(&grid, kernel_size, self.blur_sigma, self.border_mode)?
            } else {
                // Nothing to blur with; q passes through unperturbed.
                tracing::debug!(
                    height,
                    width,
                    kernel_size,
                    sigma = self.blur_sigma,
                    "kernel below 3, skipping query blur"
                );
                grid
            }
        } else {
            tracing::debug!(height, width, "collapsing query to its spatial mean");
            spatial_mean(&grid)?
        };

        from_spatial(&grid)
    }
}

impl<A: AttentionFn> AttentionOverride for SmoothedEnergyAttention<A> {
    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        options: &ExtraOptions,
        _mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let heads = options.n_heads()?;
        let q = self.perturb_query(q, options)?;
        self.attention.attend(&q, k, v, heads)
    }
}

/// Build a Smoothed Energy Guidance override around `attention`.
///
/// `blur_sigma >= 0` enables the Gaussian blur; a negative value replaces
/// the query by its spatial mean.
pub fn make_wrapper<A>(
    attention: A,
    blur_sigma: f64,
    border_mode: BorderMode,
) -> Arc<dyn AttentionOverride>
where
    A: AttentionFn + 'static,
{
    Arc::new(SmoothedEnergyAttention::new(attention, blur_sigma, border_mode))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use candle_core::{DType, Device};

    use super::*;
    use crate::attention::ScaledDotProductAttention;
    use crate::error::PagError;

    /// Attention stub that returns the (perturbed) query it was given.
    fn echo_query(q: &Tensor, _k: &Tensor, _v: &Tensor, _heads: usize) -> Result<Tensor> {
        Ok(q.clone())
    }

    fn ramp(batch: usize, area: usize, channels: usize) -> Tensor {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let n = (batch * area * channels) as f32;
        Tensor::arange(0f32, n, &Device::Cpu)
            .unwrap()
            .reshape((batch, area, channels))
            .unwrap()
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn opts(height: usize, width: usize) -> ExtraOptions {
        ExtraOptions::new()
            .with_n_heads(1)
            .with_original_shape(&[1, 4, height, width])
    }

    #[test]
    fn tiny_sigma_leaves_query_unchanged() {
        let q = ramp(2, 8, 3);
        let seg = SmoothedEnergyAttention::new(echo_query, 0.1, BorderMode::Reflect);
        let out = seg.forward(&q, &q, &q, &opts(16, 32), None).unwrap();
        assert_eq!(flat(&out), flat(&q));
    }

    #[test]
    fn capped_kernel_on_thin_grid_skips_blur() {
        // 1 x 8 grid caps the kernel at 1
        let q = ramp(1, 8, 2);
        let seg = SmoothedEnergyAttention::new(echo_query, 10.0, BorderMode::Reflect);
        let out = seg.forward(&q, &q, &q, &opts(8, 64), None).unwrap();
        assert_eq!(flat(&out), flat(&q));
    }

    #[test]
    fn negative_sigma_collapses_to_mean() {
        let q = ramp(2, 8, 3);
        let seg = SmoothedEnergyAttention::new(echo_query, -1.0, BorderMode::Reflect);
        let out = seg.forward(&q, &q, &q, &opts(16, 32), None).unwrap();
        assert_eq!(out.dims(), &[2, 8, 3]);

        let expected = q.mean_keepdim(1).unwrap().broadcast_as((2, 8, 3)).unwrap();
        for (got, want) in flat(&out).iter().zip(flat(&expected)) {
            assert!((got - want).abs() < 1e-4);
        }
        // caller's q is not modified
        assert!((flat(&q)[0] - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn blur_preserves_constant_query() {
        let q = Tensor::full(0.75f32, (1, 64, 4), &Device::Cpu).unwrap();
        let seg = SmoothedEnergyAttention::new(echo_query, 1.0, BorderMode::Reflect);
        let out = seg.forward(&q, &q, &q, &opts(64, 64), None).unwrap();
        assert!(flat(&out).iter().all(|v| (v - 0.75).abs() < 1e-5));
    }

    #[test]
    fn blur_changes_varying_query() {
        let q = ramp(1, 64, 2);
        let seg = SmoothedEnergyAttention::new(echo_query, 1.0, BorderMode::Replicate);
        let out = seg.forward(&q, &q, &q, &opts(64, 64), None).unwrap();
        assert_eq!(out.dims(), q.dims());
        assert_ne!(flat(&out), flat(&q));
    }

    #[test]
    fn delegates_heads_and_unmodified_kv() {
        let seen = Mutex::new(None);
        let spy = |_q: &Tensor, k: &Tensor, v: &Tensor, heads: usize| -> Result<Tensor> {
            *seen.lock().unwrap() = Some((heads, flat(k), flat(v)));
            Ok(v.clone())
        };
        let q = ramp(1, 16, 4);
        let k = Tensor::ones((1, 16, 4), DType::F32, &Device::Cpu).unwrap();
        let v = ramp(1, 16, 4).affine(2.0, 1.0).unwrap();
        let options = ExtraOptions::new()
            .with_n_heads(4)
            .with_original_shape(&[1, 4, 32, 32]);
        let seg = SmoothedEnergyAttention::new(spy, 3.0, BorderMode::Circular);
        seg.forward(&q, &k, &v, &options, None).unwrap();

        let (heads, k_seen, v_seen) = seen.lock().unwrap().take().unwrap();
        assert_eq!(heads, 4);
        assert_eq!(k_seen, flat(&k));
        assert_eq!(v_seen, flat(&v));
    }

    #[test]
    fn missing_options_fail() {
        let q = ramp(1, 16, 4);
        let seg = SmoothedEnergyAttention::new(echo_query, 1.0, BorderMode::Reflect);
        let no_heads = ExtraOptions::new().with_original_shape(&[1, 4, 8, 8]);
        assert!(matches!(
            seg.forward(&q, &q, &q, &no_heads, None),
            Err(PagError::MissingOption(_))
        ));
        let no_shape = ExtraOptions::new().with_n_heads(1);
        assert!(matches!(
            seg.forward(&q, &q, &q, &no_shape, None),
            Err(PagError::MissingOption(_))
        ));
    }

    #[test]
    fn make_wrapper_runs_reference_attention() {
        let wrapper = make_wrapper(ScaledDotProductAttention, 0.5, BorderMode::Constant);
        let q = ramp(1, 16, 4);
        let out = wrapper.forward(&q, &q, &q, &opts(32, 32), None).unwrap();
        assert_eq!(out.dims(), &[1, 16, 4]);
    }
}
