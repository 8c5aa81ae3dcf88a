// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-pag.

/// Errors raised by attention overrides, the block selector parser, and
/// guidance configuration.
#[derive(Debug, thiserror::Error)]
pub enum PagError {
    /// Tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// A required key is absent from the attention extra options.
    #[error("missing extra option `{0}`")]
    MissingOption(String),

    /// Spatial height or width could not be derived from the token count.
    #[error("degenerate shape: {0}")]
    DegenerateShape(String),

    /// Selector token does not start with `d`, `m` or `u`.
    #[error("invalid layer prefix `{prefix}` in block selector `{token}` (expected d, m or u)")]
    InvalidLayerPrefix {
        /// The offending selector token.
        token: String,
        /// Its first character.
        prefix: char,
    },

    /// Selector addresses a run-length group that does not exist.
    #[error("block position {position} in selector `{token}` is out of range ({len} groups)")]
    IndexOutOfRange {
        /// The offending selector token.
        token: String,
        /// Requested group position.
        position: i64,
        /// Number of groups known for that layer.
        len: usize,
    },

    /// Selector sub-index falls outside the addressed run.
    #[error("sub-index {sub_index} in selector `{token}` is not within [0, {count})")]
    SubIndexOutOfBounds {
        /// The offending selector token.
        token: String,
        /// Requested sub-index.
        sub_index: i64,
        /// Run length of the addressed group.
        count: usize,
    },

    /// Malformed selector token or module name.
    #[error("selector error: {0}")]
    Selector(String),

    /// Guidance configuration parsing error.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type alias for candle-pag operations.
pub type Result<T> = std::result::Result<T, PagError>;
