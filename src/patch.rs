// SPDX-License-Identifier: MIT OR Apache-2.0

//! Where attention overrides are installed.
//!
//! [`PatchSpec`] pairs resolved [`BlockAddress`]es with the override to run
//! there. The sampler asks it, per self-attention call, whether the current
//! `(group, block_number, transformer_index)` is patched; when it is not,
//! the regular attention runs. An empty spec adds no work.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use candle_pag::{BlockAddress, IdentityAttention, LayerGroup, PatchSpec};
//!
//! let mut patches = PatchSpec::new();
//! patches.patch(
//!     BlockAddress::new(LayerGroup::Middle, 0, None),
//!     Arc::new(IdentityAttention),
//! );
//! assert!(patches.override_at(LayerGroup::Middle, 0, 3).is_some());
//! assert!(patches.override_at(LayerGroup::Output, 0, 0).is_none());
//! ```

use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;

use crate::attention::AttentionOverride;
use crate::blocks::{BlockAddress, LayerGroup};
use crate::error::Result;
use crate::options::ExtraOptions;

/// Attention overrides keyed by block address.
#[derive(Clone, Default)]
pub struct PatchSpec {
    /// Installed overrides, in installation order.
    // TRAIT_OBJECT: identity and smoothed overrides share one registry
    patches: Vec<(BlockAddress, Arc<dyn AttentionOverride>)>,
}

impl fmt::Debug for PatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchSpec")
            .field("addresses", &self.addresses().collect::<Vec<_>>())
            .finish()
    }
}

impl PatchSpec {
    /// Create an empty patch specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `attention` at `address`.
    pub fn patch(
        &mut self,
        address: BlockAddress,
        attention: Arc<dyn AttentionOverride>,
    ) -> &mut Self {
        self.patches.push((address, attention));
        self
    }

    /// Install the same override at every address.
    pub fn patch_all<I>(&mut self, addresses: I, attention: &Arc<dyn AttentionOverride>) -> &mut Self
    where
        I: IntoIterator<Item = BlockAddress>,
    {
        for address in addresses {
            self.patches.push((address, Arc::clone(attention)));
        }
        self
    }

    /// The override for a self-attention call site, if any.
    ///
    /// When several patches cover the same site the most recently
    /// installed one wins.
    #[must_use]
    pub fn override_at(
        &self,
        group: LayerGroup,
        block_number: usize,
        transformer_index: usize,
    ) -> Option<&Arc<dyn AttentionOverride>> {
        self.patches
            .iter()
            .rev()
            .find(|(address, _)| address.matches(group, block_number, transformer_index))
            .map(|(_, attention)| attention)
    }

    /// Whether any patch covers the call site.
    #[must_use]
    pub fn is_patched(&self, group: LayerGroup, block_number: usize, transformer_index: usize) -> bool {
        self.override_at(group, block_number, transformer_index)
            .is_some()
    }

    /// Installed addresses, in installation order.
    pub fn addresses(&self) -> impl Iterator<Item = &BlockAddress> {
        self.patches.iter().map(|(address, _)| address)
    }

    /// Whether nothing is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Number of installed patches.
    #[must_use]
    pub fn num_patches(&self) -> usize {
        self.patches.len()
    }

    /// Run the override installed at the call site, or `fallback` if none.
    ///
    /// # Errors
    ///
    /// Propagates the error of whichever attention runs.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &self,
        site: (LayerGroup, usize, usize),
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        options: &ExtraOptions,
        mask: Option<&Tensor>,
        fallback: &dyn AttentionOverride,
    ) -> Result<Tensor> {
        let (group, block_number, transformer_index) = site;
        match self.override_at(group, block_number, transformer_index) {
            Some(attention) => attention.forward(q, k, v, options, mask),
            None => fallback.forward(q, k, v, options, mask),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
