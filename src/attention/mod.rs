// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pluggable self-attention substitutes.
//!
//! A sampler calls an [`AttentionOverride`] in place of a U-Net block's
//! self-attention with `(q, k, v, extra_options, mask)`. Overrides that
//! still want real attention delegate to an [`AttentionFn`], the plain
//! `(q, k, v, heads)` calling convention.
//!
//! - [`IdentityAttention`] returns `v` unchanged (Perturbed Attention
//!   Guidance).
//! - [`SmoothedEnergyAttention`] blurs or flattens `q` spatially before
//!   delegating (Smoothed Energy Guidance).
//! - [`ScaledDotProductAttention`] is the unperturbed reference.

mod identity;
mod smoothed;

pub use identity::IdentityAttention;
pub use smoothed::{SmoothedEnergyAttention, make_wrapper};

use candle_core::{DType, Tensor};

use crate::error::{PagError, Result};
use crate::options::ExtraOptions;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Drop-in replacement for a block's self-attention.
///
/// Implementations must be callable concurrently from any sampling thread.
pub trait AttentionOverride: Send + Sync {
    /// Compute the substitute attention output.
    ///
    /// # Shapes
    /// - `q`: `[batch, tokens, heads * head_dim]`
    /// - `k`, `v`: `[batch, kv_tokens, heads * head_dim]`
    /// - `mask`: optional additive mask broadcastable to
    ///   `[batch, heads, tokens, kv_tokens]`
    /// - returns: `[batch, tokens, heads * head_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`PagError::MissingOption`] when a required option is absent
    /// and [`PagError::Model`] on tensor operation failures.
    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        options: &ExtraOptions,
        mask: Option<&Tensor>,
    ) -> Result<Tensor>;
}

/// Attention function with the `(q, k, v, heads)` calling convention.
///
/// Blanket-implemented for closures, so any
/// `Fn(&Tensor, &Tensor, &Tensor, usize) -> Result<Tensor>` can be wrapped.
pub trait AttentionFn: Send + Sync {
    /// Multi-head attention over token-major tensors.
    ///
    /// # Errors
    ///
    /// Implementation defined; typically [`PagError::Model`].
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, heads: usize) -> Result<Tensor>;
}

impl<F> AttentionFn for F
where
    F: Fn(&Tensor, &Tensor, &Tensor, usize) -> Result<Tensor> + Send + Sync,
{
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, heads: usize) -> Result<Tensor> {
        self(q, k, v, heads)
    }
}

// ---------------------------------------------------------------------------
// ScaledDotProductAttention
// ---------------------------------------------------------------------------

/// Standard multi-head `softmax(q k^T / sqrt(head_dim)) v`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaledDotProductAttention;

impl AttentionFn for ScaledDotProductAttention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, heads: usize) -> Result<Tensor> {
        scaled_dot_product_attention(q, k, v, heads, None)
    }
}

impl AttentionOverride for ScaledDotProductAttention {
    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        options: &ExtraOptions,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        scaled_dot_product_attention(q, k, v, options.n_heads()?, mask)
    }
}

/// Multi-head scaled dot-product attention over token-major tensors.
///
/// # Shapes
/// - `q`: `[batch, tokens, heads * head_dim]`
/// - `k`: `[batch, kv_tokens, heads * head_dim]`
/// - `v`: `[batch, kv_tokens, heads * v_head_dim]`
/// - `mask`: optional, broadcastable to `[batch, heads, tokens, kv_tokens]`
/// - returns: `[batch, tokens, heads * v_head_dim]`
///
/// # Errors
///
/// Returns [`PagError::DegenerateShape`] if `heads` is zero or does not
/// divide the channel dimension, and [`PagError::Model`] on tensor
/// operation failures.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    heads: usize,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let (batch, seq_len, inner_dim) = q.dims3()?;
    let (_, kv_len, v_inner_dim) = v.dims3()?;
    if heads == 0 || inner_dim % heads != 0 || v_inner_dim % heads != 0 {
        return Err(PagError::DegenerateShape(format!(
            "{heads} heads do not divide channel dims {inner_dim}/{v_inner_dim}"
        )));
    }
    let head_dim = inner_dim / heads;
    let v_head_dim = v_inner_dim / heads;

    // Reshape to [batch, seq, n_heads, head_dim] then transpose to [batch, n_heads, seq, head_dim]
    let q = q
        .reshape((batch, seq_len, heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?;
    // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
    let k_t = k
        .reshape((batch, kv_len, heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?
        .transpose(2, 3)?;
    let v = v
        .reshape((batch, kv_len, heads, v_head_dim))?
        .transpose(1, 2)?
        .contiguous()?;

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let scale = 1.0 / (head_dim as f64).sqrt();
    let mut scores = (q.matmul(&k_t)? * scale)?;
    if let Some(mask) = mask {
        scores = scores.broadcast_add(mask)?;
    }

    // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
    let original_dtype = scores.dtype();
    let scores_f32 = if original_dtype == DType::F32 {
        scores
    } else {
        scores.to_dtype(DType::F32)?
    };
    let mut pattern = candle_nn::ops::softmax_last_dim(&scores_f32)?;
    if original_dtype != DType::F32 {
        pattern = pattern.to_dtype(original_dtype)?;
    }

    let out = pattern.matmul(&v)?;
    Ok(out
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, seq_len, heads * v_head_dim))?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
