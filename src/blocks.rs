// SPDX-License-Identifier: MIT OR Apache-2.0

//! U-Net block selectors.
//!
//! A selector string such as `"d2.1, m0, u1"` picks self-attention layers
//! out of a U-Net. Each token names a layer group (`d` = input/down,
//! `m` = middle, `u` = output/up), a position in that group's run-length
//! encoded block list, and optionally which transformer inside the run.
//!
//! The run-length lists come from the live module tree: every
//! self-attention module (`CrossAttention` named `...attn1` by default)
//! contributes the block index from its dotted name, and consecutive
//! repeats of an index form one run.
//!
//! ```
//! use candle_pag::{BlockAddress, LayerGroup, NamedModule, parse_block_selectors};
//!
//! let modules = vec![
//!     NamedModule::new("input_blocks.1.1.transformer_blocks.0.attn1", "CrossAttention"),
//!     NamedModule::new("input_blocks.1.1.transformer_blocks.1.attn1", "CrossAttention"),
//!     NamedModule::new("middle_block.1.transformer_blocks.0.attn1", "CrossAttention"),
//! ];
//! let addresses = parse_block_selectors(&modules, "d0.1, m0").unwrap();
//! assert_eq!(
//!     addresses,
//!     vec![
//!         BlockAddress::new(LayerGroup::Input, 1, Some(1)),
//!         BlockAddress::new(LayerGroup::Middle, 0, None),
//!     ]
//! );
//! ```

use std::fmt;

use crate::error::{PagError, Result};

// ---------------------------------------------------------------------------
// LayerGroup
// ---------------------------------------------------------------------------

/// One of the three block groups of a U-Net.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerGroup {
    /// Down-sampling path (`input_blocks`).
    Input,
    /// Bottleneck (`middle_block`).
    Middle,
    /// Up-sampling path (`output_blocks`).
    Output,
}

impl fmt::Display for LayerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Middle => write!(f, "middle"),
            Self::Output => write!(f, "output"),
        }
    }
}

impl LayerGroup {
    /// Map a selector prefix character (`d`, `m`, `u`) to a group.
    #[must_use]
    pub const fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            'd' => Some(Self::Input),
            'm' => Some(Self::Middle),
            'u' => Some(Self::Output),
            _ => None,
        }
    }

    /// Classify a top-level module name (`input_blocks`, `middle_block`, ...).
    #[must_use]
    pub fn from_module_prefix(name: &str) -> Option<Self> {
        if name.starts_with("input") {
            Some(Self::Input)
        } else if name.starts_with("middle") {
            Some(Self::Middle)
        } else if name.starts_with("output") {
            Some(Self::Output)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// BlockAddress
// ---------------------------------------------------------------------------

/// A resolved self-attention target: `(group, block_number, sub_index)`.
///
/// `sub_index == None` addresses every transformer in the block's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAddress {
    /// Layer group.
    pub group: LayerGroup,
    /// Block index as it appears in the module names.
    pub block_number: usize,
    /// Transformer within the run, or all of them.
    pub sub_index: Option<usize>,
}

impl BlockAddress {
    /// Create an address.
    #[must_use]
    pub const fn new(group: LayerGroup, block_number: usize, sub_index: Option<usize>) -> Self {
        Self {
            group,
            block_number,
            sub_index,
        }
    }

    /// Whether this address covers transformer `transformer_index` of block
    /// `block_number` in `group`.
    #[must_use]
    pub fn matches(&self, group: LayerGroup, block_number: usize, transformer_index: usize) -> bool {
        self.group == group
            && self.block_number == block_number
            && self.sub_index.is_none_or(|sub| sub == transformer_index)
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_index {
            Some(sub) => write!(f, "{}.{}.{sub}", self.group, self.block_number),
            None => write!(f, "{}.{}", self.group, self.block_number),
        }
    }
}

// ---------------------------------------------------------------------------
// Run-length encoding
// ---------------------------------------------------------------------------

/// A run of `count` consecutive occurrences of block index `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLengthGroup {
    /// Block index.
    pub value: usize,
    /// Number of consecutive self-attention modules with that index.
    pub count: usize,
}

impl RunLengthGroup {
    /// Create a run.
    #[must_use]
    pub const fn new(value: usize, count: usize) -> Self {
        Self { value, count }
    }
}

/// Merge consecutive equal indices into runs, preserving order.
///
/// Non-adjacent repeats start a new run.
///
/// ```
/// use candle_pag::{RunLengthGroup, run_length_encode};
///
/// assert_eq!(
///     run_length_encode(&[0, 0, 1, 1, 1, 0]),
///     vec![RunLengthGroup::new(0, 2), RunLengthGroup::new(1, 3), RunLengthGroup::new(0, 1)]
/// );
/// ```
#[must_use]
pub fn run_length_encode(indices: &[usize]) -> Vec<RunLengthGroup> {
    let mut runs: Vec<RunLengthGroup> = Vec::new();
    for &value in indices {
        match runs.last_mut() {
            Some(run) if run.value == value => run.count += 1,
            _ => runs.push(RunLengthGroup::new(value, 1)),
        }
    }
    runs
}

// ---------------------------------------------------------------------------
// Module enumeration
// ---------------------------------------------------------------------------

/// A submodule of the diffusion network: dotted path plus type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedModule {
    /// Dotted hierarchical name, e.g. `input_blocks.4.1.transformer_blocks.0.attn1`.
    pub name: String,
    /// Runtime type tag, e.g. `CrossAttention`.
    pub type_name: String,
}

impl NamedModule {
    /// Create a module entry.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Read-only enumeration of a model's submodules in traversal order.
pub trait ModuleTree {
    /// All named submodules of the diffusion network.
    fn named_modules(&self) -> Vec<NamedModule>;
}

impl ModuleTree for [NamedModule] {
    fn named_modules(&self) -> Vec<NamedModule> {
        self.to_vec()
    }
}

impl ModuleTree for Vec<NamedModule> {
    fn named_modules(&self) -> Vec<NamedModule> {
        self.clone()
    }
}

/// Decides which modules are self-attention layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfAttentionMatcher {
    /// Required type tag.
    pub type_name: String,
    /// Required name suffix.
    pub name_suffix: String,
}

impl Default for SelfAttentionMatcher {
    fn default() -> Self {
        Self {
            type_name: "CrossAttention".to_string(),
            name_suffix: "attn1".to_string(),
        }
    }
}

impl SelfAttentionMatcher {
    /// Whether `module` is a self-attention layer.
    #[must_use]
    pub fn matches(&self, module: &NamedModule) -> bool {
        module.type_name == self.type_name && module.name.ends_with(&self.name_suffix)
    }
}

// ---------------------------------------------------------------------------
// UnetLayout
// ---------------------------------------------------------------------------

/// Run-length encoded self-attention blocks of each layer group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnetLayout {
    /// Runs in `input_blocks`.
    pub input: Vec<RunLengthGroup>,
    /// Runs in `middle_block`, renumbered from zero.
    pub middle: Vec<RunLengthGroup>,
    /// Runs in `output_blocks`.
    pub output: Vec<RunLengthGroup>,
}

impl UnetLayout {
    /// Build a layout from explicit runs.
    #[must_use]
    pub const fn from_groups(
        input: Vec<RunLengthGroup>,
        middle: Vec<RunLengthGroup>,
        output: Vec<RunLengthGroup>,
    ) -> Self {
        Self {
            input,
            middle,
            output,
        }
    }

    /// Enumerate the self-attention layers of `model`.
    ///
    /// The first two dotted segments of each matching module name give the
    /// group and the block index. Middle-block indices are shifted down by
    /// one; names outside the three groups are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PagError::Selector`] if a matching module name has no
    /// numeric block index, or a middle block has index zero.
    pub fn from_modules<M: ModuleTree + ?Sized>(
        model: &M,
        matcher: &SelfAttentionMatcher,
    ) -> Result<Self> {
        let (mut input, mut middle, mut output) = (Vec::new(), Vec::new(), Vec::new());

        for module in model.named_modules() {
            if !matcher.matches(&module) {
                continue;
            }
            let mut parts = module.name.split('.');
            let block_name = parts.next().unwrap_or_default();
            let block_id = parts
                .next()
                .and_then(|id| id.parse::<usize>().ok())
                .ok_or_else(|| {
                    PagError::Selector(format!(
                        "module `{}` has no numeric block index",
                        module.name
                    ))
                })?;

            match LayerGroup::from_module_prefix(block_name) {
                Some(LayerGroup::Input) => input.push(block_id),
                Some(LayerGroup::Middle) => {
                    let shifted = block_id.checked_sub(1).ok_or_else(|| {
                        PagError::Selector(format!(
                            "middle module `{}` has block index 0",
                            module.name
                        ))
                    })?;
                    middle.push(shifted);
                }
                Some(LayerGroup::Output) => output.push(block_id),
                None => {}
            }
        }

        let layout = Self::from_groups(
            run_length_encode(&input),
            run_length_encode(&middle),
            run_length_encode(&output),
        );
        tracing::debug!(
            input = ?layout.input,
            middle = ?layout.middle,
            output = ?layout.output,
            "enumerated self-attention blocks"
        );
        Ok(layout)
    }

    /// Runs of one layer group.
    #[must_use]
    pub fn groups(&self, group: LayerGroup) -> &[RunLengthGroup] {
        match group {
            LayerGroup::Input => &self.input,
            LayerGroup::Middle => &self.middle,
            LayerGroup::Output => &self.output,
        }
    }

    /// Parse a comma-separated selector list against this layout.
    ///
    /// Whitespace around tokens is ignored. The output has one address per
    /// token, in input order.
    ///
    /// # Errors
    ///
    /// Fails on the first invalid token with
    /// [`PagError::InvalidLayerPrefix`], [`PagError::IndexOutOfRange`],
    /// [`PagError::SubIndexOutOfBounds`] or [`PagError::Selector`]
    /// (empty token, non-integer field, more than two fields).
    pub fn parse(&self, selector: &str) -> Result<Vec<BlockAddress>> {
        selector
            .split(',')
            .map(str::trim)
            .map(|token| self.parse_token(token))
            .collect()
    }

    /// Resolve a single trimmed selector token.
    fn parse_token(&self, token: &str) -> Result<BlockAddress> {
        let mut chars = token.chars();
        let prefix = chars
            .next()
            .ok_or_else(|| PagError::Selector("empty block selector".into()))?;
        let group = LayerGroup::from_prefix(prefix).ok_or_else(|| PagError::InvalidLayerPrefix {
            token: token.to_string(),
            prefix,
        })?;

        let mut fields = chars.as_str().split('.');
        let position = parse_field(token, fields.next().unwrap_or_default())?;
        let sub_index = fields
            .next()
            .map(|field| parse_field(token, field))
            .transpose()?;
        if fields.next().is_some() {
            return Err(PagError::Selector(format!(
                "block selector `{token}` has more than two fields"
            )));
        }

        let runs = self.groups(group);
        let run = usize::try_from(position)
            .ok()
            .and_then(|pos| runs.get(pos))
            .ok_or_else(|| PagError::IndexOutOfRange {
                token: token.to_string(),
                position,
                len: runs.len(),
            })?;

        let sub_index = match sub_index {
            Some(sub) => Some(
                usize::try_from(sub)
                    .ok()
                    .filter(|&s| s < run.count)
                    .ok_or_else(|| PagError::SubIndexOutOfBounds {
                        token: token.to_string(),
                        sub_index: sub,
                        count: run.count,
                    })?,
            ),
            None => None,
        };

        let address = BlockAddress::new(group, run.value, sub_index);
        tracing::trace!(token, %address, "parsed block selector");
        Ok(address)
    }
}

/// Parse one integer field of a selector token.
fn parse_field(token: &str, field: &str) -> Result<i64> {
    field.parse::<i64>().map_err(|_| {
        PagError::Selector(format!(
            "block selector `{token}`: `{field}` is not an integer"
        ))
    })
}

/// Resolve `selector` against the self-attention layers of `model`.
///
/// Uses the default [`SelfAttentionMatcher`]. The model is enumerated on
/// every call; nothing is cached.
///
/// # Errors
///
/// See [`UnetLayout::from_modules`] and [`UnetLayout::parse`].
pub fn parse_block_selectors<M: ModuleTree + ?Sized>(
    model: &M,
    selector: &str,
) -> Result<Vec<BlockAddress>> {
    UnetLayout::from_modules(model, &SelfAttentionMatcher::default())?.parse(selector)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn runs(pairs: &[(usize, usize)]) -> Vec<RunLengthGroup> {
        pairs
            .iter()
            .map(|&(value, count)| RunLengthGroup::new(value, count))
            .collect()
    }

    fn layout() -> UnetLayout {
        UnetLayout::from_groups(
            runs(&[(0, 3), (1, 2)]),
            runs(&[(0, 1), (1, 4)]),
            runs(&[(2, 1), (3, 5)]),
        )
    }

    fn attn(name: &str) -> NamedModule {
        NamedModule::new(name, "CrossAttention")
    }

    #[test]
    fn run_length_splits_non_adjacent_repeats() {
        assert_eq!(
            run_length_encode(&[0, 0, 1, 1, 1, 0]),
            runs(&[(0, 2), (1, 3), (0, 1)])
        );
        assert!(run_length_encode(&[]).is_empty());
    }

    #[test]
    fn parse_mixed_selectors() {
        let parsed = layout().parse("d0,m1.2,u3").unwrap();
        assert_eq!(
            parsed,
            vec![
                BlockAddress::new(LayerGroup::Input, 0, None),
                BlockAddress::new(LayerGroup::Middle, 1, Some(2)),
                BlockAddress::new(LayerGroup::Output, 3, None),
            ]
        );
    }

    #[test]
    fn position_selects_run_not_block_number() {
        // position 1 of output runs is block 3
        let parsed = layout().parse(" u1.4 , d1 ").unwrap();
        assert_eq!(
            parsed,
            vec![
                BlockAddress::new(LayerGroup::Output, 3, Some(4)),
                BlockAddress::new(LayerGroup::Input, 1, None),
            ]
        );
    }

    #[test]
    fn sub_index_out_of_bounds() {
        let err = layout().parse("m1.5").unwrap_err();
        assert!(matches!(
            err,
            PagError::SubIndexOutOfBounds {
                sub_index: 5,
                count: 4,
                ..
            }
        ));
        assert!(matches!(
            layout().parse("m1.-1"),
            Err(PagError::SubIndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn invalid_prefix() {
        let err = layout().parse("x0").unwrap_err();
        assert!(matches!(err, PagError::InvalidLayerPrefix { prefix: 'x', .. }));
    }

    #[test]
    fn position_out_of_range() {
        assert!(matches!(
            layout().parse("d2"),
            Err(PagError::IndexOutOfRange {
                position: 2,
                len: 2,
                ..
            })
        ));
        assert!(matches!(
            layout().parse("d-1"),
            Err(PagError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn malformed_tokens() {
        assert!(matches!(layout().parse("d0,"), Err(PagError::Selector(_))));
        assert!(matches!(layout().parse("m"), Err(PagError::Selector(_))));
        assert!(matches!(layout().parse("ma"), Err(PagError::Selector(_))));
        assert!(matches!(layout().parse("m1.1.1"), Err(PagError::Selector(_))));
    }

    #[test]
    fn no_partial_results() {
        // first token valid, second invalid
        assert!(layout().parse("d0, x1").is_err());
    }

    #[test]
    fn enumerates_modules() {
        let modules = vec![
            attn("input_blocks.1.1.transformer_blocks.0.attn1"),
            NamedModule::new("input_blocks.1.1.transformer_blocks.0.attn2", "CrossAttention"),
            NamedModule::new("input_blocks.1.0.in_layers.2", "Conv2d"),
            attn("input_blocks.2.1.transformer_blocks.0.attn1"),
            attn("input_blocks.2.1.transformer_blocks.1.attn1"),
            attn("middle_block.1.transformer_blocks.0.attn1"),
            attn("output_blocks.3.1.transformer_blocks.0.attn1"),
            attn("output_blocks.3.1.transformer_blocks.1.attn1"),
            attn("output_blocks.3.1.transformer_blocks.2.attn1"),
            attn("label_emb.0.attn1"),
        ];
        let layout = UnetLayout::from_modules(&modules, &SelfAttentionMatcher::default()).unwrap();
        assert_eq!(layout.input, runs(&[(1, 1), (2, 2)]));
        assert_eq!(layout.middle, runs(&[(0, 1)]));
        assert_eq!(layout.output, runs(&[(3, 3)]));
    }

    #[test]
    fn custom_matcher() {
        let modules = vec![NamedModule::new(
            "output_blocks.5.1.transformer_blocks.0.self_attn",
            "Attention",
        )];
        let matcher = SelfAttentionMatcher {
            type_name: "Attention".into(),
            name_suffix: "self_attn".into(),
        };
        let layout = UnetLayout::from_modules(&modules, &matcher).unwrap();
        assert_eq!(layout.output, runs(&[(5, 1)]));
        assert!(UnetLayout::from_modules(&modules, &SelfAttentionMatcher::default())
            .unwrap()
            .output
            .is_empty());
    }

    #[test]
    fn bad_module_names() {
        let modules = vec![attn("middle_block.0.attn1")];
        assert!(UnetLayout::from_modules(&modules, &SelfAttentionMatcher::default()).is_err());
        let modules = vec![attn("input_blocks.attn1")];
        assert!(UnetLayout::from_modules(&modules, &SelfAttentionMatcher::default()).is_err());
    }

    #[test]
    fn address_matching_and_display() {
        let whole = BlockAddress::new(LayerGroup::Output, 3, None);
        let single = BlockAddress::new(LayerGroup::Middle, 0, Some(2));
        assert!(whole.matches(LayerGroup::Output, 3, 0));
        assert!(whole.matches(LayerGroup::Output, 3, 7));
        assert!(!whole.matches(LayerGroup::Input, 3, 0));
        assert!(single.matches(LayerGroup::Middle, 0, 2));
        assert!(!single.matches(LayerGroup::Middle, 0, 1));
        assert_eq!(whole.to_string(), "output.3");
        assert_eq!(single.to_string(), "middle.0.2");
    }
}
