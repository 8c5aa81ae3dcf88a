// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-call attention metadata supplied by the sampler.
//!
//! The sampler hands every attention override a loosely typed options
//! object. Only two keys are consumed here: `n_heads` and
//! `original_shape` (the latent shape, `[batch, channels, height, width]`).
//! Everything else is carried through untouched.
//!
//! ```
//! use candle_pag::ExtraOptions;
//!
//! let opts = ExtraOptions::new()
//!     .with_n_heads(8)
//!     .with_original_shape(&[2, 4, 64, 128]);
//! assert_eq!(opts.n_heads().unwrap(), 8);
//! assert!((opts.aspect_ratio().unwrap() - 2.0).abs() < f64::EPSILON);
//! ```

use serde_json::{Map, Value};

use crate::error::{PagError, Result};

/// Key holding the number of attention heads.
pub const N_HEADS: &str = "n_heads";

/// Key holding the original latent shape.
pub const ORIGINAL_SHAPE: &str = "original_shape";

/// Extra options passed alongside `(q, k, v)` to an attention override.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraOptions {
    /// Raw key/value pairs.
    values: Map<String, Value>,
}

impl ExtraOptions {
    /// Create an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`PagError::Config`] if `value` is not a JSON object.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            other => Err(PagError::Config(format!(
                "extra options must be a JSON object, got {other}"
            ))),
        }
    }

    /// Set `n_heads`.
    #[must_use]
    pub fn with_n_heads(mut self, n_heads: usize) -> Self {
        self.values.insert(N_HEADS.to_string(), Value::from(n_heads));
        self
    }

    /// Set `original_shape`.
    #[must_use]
    pub fn with_original_shape(mut self, shape: &[usize]) -> Self {
        self.values
            .insert(ORIGINAL_SHAPE.to_string(), Value::from(shape.to_vec()));
        self
    }

    /// Set an arbitrary key.
    #[must_use]
    pub fn with_value(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    /// Look up a raw value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Number of attention heads.
    ///
    /// # Errors
    ///
    /// Returns [`PagError::MissingOption`] if `n_heads` is absent or not a
    /// non-negative integer.
    pub fn n_heads(&self) -> Result<usize> {
        self.values
            .get(N_HEADS)
            .and_then(Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| PagError::MissingOption(N_HEADS.to_string()))
    }

    /// The original latent shape as floats.
    ///
    /// # Errors
    ///
    /// Returns [`PagError::MissingOption`] if `original_shape` is absent or
    /// is not an array of numbers.
    pub fn original_shape(&self) -> Result<Vec<f64>> {
        let missing = || PagError::MissingOption(ORIGINAL_SHAPE.to_string());
        self.values
            .get(ORIGINAL_SHAPE)
            .and_then(Value::as_array)
            .ok_or_else(missing)?
            .iter()
            .map(|dim| dim.as_f64().ok_or_else(missing))
            .collect()
    }

    /// Original `(height, width)`, taken from `original_shape[2..4]`.
    ///
    /// # Errors
    ///
    /// Returns [`PagError::MissingOption`] if the shape has fewer than four
    /// elements.
    pub fn original_height_width(&self) -> Result<(f64, f64)> {
        let shape = self.original_shape()?;
        match (shape.get(2), shape.get(3)) {
            (Some(&height), Some(&width)) => Ok((height, width)),
            _ => Err(PagError::MissingOption(format!("{ORIGINAL_SHAPE}[2..4]"))),
        }
    }

    /// Aspect ratio `width / height` of the original latent.
    ///
    /// # Errors
    ///
    /// Returns [`PagError::MissingOption`] as for
    /// [`original_height_width`](Self::original_height_width), and
    /// [`PagError::DegenerateShape`] if either side is not strictly positive.
    pub fn aspect_ratio(&self) -> Result<f64> {
        let (height, width) = self.original_height_width()?;
        if !(height > 0.0 && width > 0.0 && height.is_finite() && width.is_finite()) {
            return Err(PagError::DegenerateShape(format!(
                "original shape {height}x{width} has no positive aspect ratio"
            )));
        }
        Ok(width / height)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
