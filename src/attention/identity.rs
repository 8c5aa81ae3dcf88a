// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identity self-attention for Perturbed Attention Guidance.

use candle_core::Tensor;

use crate::error::Result;
use crate::options::ExtraOptions;

use super::AttentionOverride;

/// Replaces the attention matrix with the identity: the output is `v`.
///
/// Each token attends only to itself, which removes all spatial mixing
/// from the block.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAttention;

impl AttentionOverride for IdentityAttention {
    fn forward(
        &self,
        _q: &Tensor,
        _k: &Tensor,
        v: &Tensor,
        _options: &ExtraOptions,
        _mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        Ok(v.clone())
    }
}
