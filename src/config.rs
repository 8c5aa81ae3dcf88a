// SPDX-License-Identifier: MIT OR Apache-2.0

//! Guidance configuration and JSON parsing.
//!
//! [`GuidanceConfig`] selects which perturbation to install and where:
//!
//! | Key | Type | Default |
//! |-----|------|---------|
//! | `mode` | `"pag"` or `"seg"` | required |
//! | `blur_sigma` | number | `10.0` |
//! | `border_mode` | `"reflect"`, `"replicate"`, `"constant"`, `"circular"` | `"reflect"` |
//! | `unet_block_list` | selector string | `"m0"` |
//!
//! # Usage
//!
//! ```
//! use candle_pag::{GuidanceConfig, GuidanceMode};
//!
//! let json = serde_json::json!({"mode": "seg", "blur_sigma": 3.0, "unet_block_list": "m0, u0.1"});
//! let config = GuidanceConfig::from_json(&json).unwrap();
//! assert_eq!(config.mode, GuidanceMode::SmoothedEnergy);
//! assert_eq!(config.unet_block_list, "m0, u0.1");
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::attention::{AttentionFn, AttentionOverride, IdentityAttention, make_wrapper};
use crate::blocks::{ModuleTree, parse_block_selectors};
use crate::blur::BorderMode;
use crate::error::{PagError, Result};
use crate::patch::PatchSpec;

/// Default Gaussian sigma for Smoothed Energy Guidance.
pub const DEFAULT_BLUR_SIGMA: f64 = 10.0;

/// Default block selector: the middle block.
pub const DEFAULT_BLOCK_LIST: &str = "m0";

// ---------------------------------------------------------------------------
// GuidanceMode
// ---------------------------------------------------------------------------

/// Which self-attention perturbation to install.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceMode {
    /// Perturbed Attention Guidance: identity attention.
    Perturbed,
    /// Smoothed Energy Guidance: blurred query.
    SmoothedEnergy,
}

impl fmt::Display for GuidanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Perturbed => write!(f, "pag"),
            Self::SmoothedEnergy => write!(f, "seg"),
        }
    }
}

// ---------------------------------------------------------------------------
// GuidanceConfig
// ---------------------------------------------------------------------------

/// Configuration of an attention-perturbation guidance pass.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidanceConfig {
    /// Perturbation kind.
    pub mode: GuidanceMode,
    /// Blur sigma (SEG only); negative collapses the query to its mean.
    pub blur_sigma: f64,
    /// Blur padding policy (SEG only).
    pub border_mode: BorderMode,
    /// Which self-attention blocks to patch.
    pub unet_block_list: String,
}

impl GuidanceConfig {
    /// Parse a configuration from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`PagError::Config`] if `mode` is missing or unknown, or if
    /// `border_mode` is not a recognised border mode.
    pub fn from_json(config: &Value) -> Result<Self> {
        let mode = match get_str(config, "mode")? {
            "pag" => GuidanceMode::Perturbed,
            "seg" => GuidanceMode::SmoothedEnergy,
            other => {
                return Err(PagError::Config(format!(
                    "unsupported guidance mode '{other}'"
                )));
            }
        };
        let border_mode = get_str_or(config, "border_mode", "reflect").parse::<BorderMode>()?;

        Ok(Self {
            mode,
            blur_sigma: get_f64_or(config, "blur_sigma", DEFAULT_BLUR_SIGMA),
            border_mode,
            unet_block_list: get_str_or(config, "unet_block_list", DEFAULT_BLOCK_LIST).to_string(),
        })
    }

    /// Build the configured override, delegating SEG to `attention`.
    pub fn build_override<A>(&self, attention: A) -> Arc<dyn AttentionOverride>
    where
        A: AttentionFn + 'static,
    {
        match self.mode {
            GuidanceMode::Perturbed => Arc::new(IdentityAttention),
            GuidanceMode::SmoothedEnergy => make_wrapper(attention, self.blur_sigma, self.border_mode),
        }
    }

    /// Resolve the block list against `model` and install the override.
    ///
    /// # Errors
    ///
    /// Returns the selector errors of
    /// [`parse_block_selectors`](crate::parse_block_selectors).
    pub fn build_patches<M, A>(&self, model: &M, attention: A) -> Result<PatchSpec>
    where
        M: ModuleTree + ?Sized,
        A: AttentionFn + 'static,
    {
        let addresses = parse_block_selectors(model, &self.unet_block_list)?;
        let mut patches = PatchSpec::new();
        patches.patch_all(addresses, &self.build_override(attention));
        tracing::info!(
            mode = %self.mode,
            blocks = %self.unet_block_list,
            patches = patches.num_patches(),
            "installed attention patches"
        );
        Ok(patches)
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required string field from a JSON object.
fn get_str<'a>(config: &'a Value, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| PagError::Config(format!("missing or invalid field '{key}'")))
}

/// Extract a string field, returning a default if absent.
fn get_str_or<'a>(config: &'a Value, key: &str, default: &'a str) -> &'a str {
    config.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
