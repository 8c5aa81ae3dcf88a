// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-pag
//!
//! Self-attention perturbations for diffusion guidance, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! A guided sampler runs an extra, deliberately degraded denoiser pass and
//! steers away from it. This crate supplies the degraded self-attention
//! and the plumbing to install it on selected U-Net blocks:
//!
//! - **Perturbed Attention Guidance**: [`IdentityAttention`] replaces the
//!   attention matrix with the identity, returning `v`.
//! - **Smoothed Energy Guidance**: [`SmoothedEnergyAttention`] folds the
//!   query back onto the latent grid, Gaussian-blurs it (or flattens it to
//!   its mean), and then runs regular attention.
//! - **Block selectors**: [`parse_block_selectors`] turns strings such as
//!   `"d2.1, m0, u1"` into [`BlockAddress`]es using the model's live
//!   self-attention modules; [`PatchSpec`] maps addresses to overrides.
//!
//! The sampling loop, model weights, and schedules live elsewhere.

#![warn(missing_docs)]

pub mod attention;
pub mod blocks;
pub mod blur;
pub mod config;
pub mod error;
pub mod options;
pub mod patch;
pub mod spatial;

pub use attention::{
    AttentionFn, AttentionOverride, IdentityAttention, ScaledDotProductAttention,
    SmoothedEnergyAttention, make_wrapper, scaled_dot_product_attention,
};
pub use blocks::{
    BlockAddress, LayerGroup, ModuleTree, NamedModule, RunLengthGroup, SelfAttentionMatcher,
    UnetLayout, parse_block_selectors, run_length_encode,
};
pub use blur::{BorderMode, gaussian_blur2d};
pub use config::{GuidanceConfig, GuidanceMode};
pub use error::{PagError, Result};
pub use options::ExtraOptions;
pub use patch::PatchSpec;
