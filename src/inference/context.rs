//! Context window management
//!
//! Keeps the resident token count within the backend's context length. When
//! a pending batch would overflow the window, the first `n_keep` tokens stay
//! resident and half of the discarded region is re-fed from the token ring.

use crate::inference::backend::TokenId;
use crate::inference::params::{GenerationParameters, AUTO};
use crate::inference::ring::TokenRing;

/// Result of a context swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwap {
    /// Tokens that were resident beyond the kept prefix
    pub discarded: usize,
    /// Tokens re-fed from the ring in front of the pending batch
    pub recovered: usize,
    /// Resident count after the swap, before the batch is evaluated
    pub past_count: usize,
}

/// Window bookkeeping for one generation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    n_ctx: usize,
    n_keep: usize,
}

impl ContextWindow {
    pub fn new(n_ctx: usize, n_keep: usize) -> Self {
        Self { n_ctx, n_keep }
    }

    pub fn context_length(&self) -> usize {
        self.n_ctx
    }

    pub fn keep_count(&self) -> usize {
        self.n_keep
    }

    /// Performs context-swap recovery if `pending` does not fit after `past_count`.
    ///
    /// The ring is expected to end with the pending batch. The resident count
    /// never drops below 1 so the beginning-of-sequence token survives.
    pub fn recover(
        &self,
        past_count: &mut usize,
        pending: &mut Vec<TokenId>,
        ring: &TokenRing,
    ) -> Option<ContextSwap> {
        if *past_count + pending.len() <= self.n_ctx {
            return None;
        }

        let discarded = past_count.saturating_sub(self.n_keep);
        let kept = self.n_keep.max(1);

        let mut batch = ring.tail_before(pending.len(), discarded / 2);
        let recovered = batch.len();
        batch.extend_from_slice(pending);

        let room = self.n_ctx.saturating_sub(kept);
        if batch.len() > room {
            let excess = batch.len() - room;
            tracing::warn!(
                excess,
                room,
                "Pending batch larger than the free window, dropping its oldest tokens"
            );
            batch.drain(..excess);
        }

        *pending = batch;
        *past_count = kept;

        Some(ContextSwap {
            discarded,
            recovered: recovered.min(pending.len()),
            past_count: kept,
        })
    }
}

/// Number of leading prompt tokens preserved across context swaps.
///
/// `speaker_tags` holds the tokenized speaker tags (user first, then the
/// character) when automatic detection is enabled; the earliest tag offset
/// becomes the keep count so the persona preamble survives. Falls back to the
/// full prompt length when nothing matches.
pub fn resolve_keep_count(
    prompt: &[TokenId],
    params: &GenerationParameters,
    speaker_tags: Option<&[Vec<TokenId>]>,
) -> usize {
    let full = prompt.len();

    if params.instruct {
        return full;
    }

    if params.n_keep == AUTO {
        return speaker_tags
            .and_then(|tags| {
                tags.iter()
                    .filter_map(|tag| find_subsequence(prompt, tag))
                    .min()
            })
            .unwrap_or(full);
    }

    if params.n_keep < 0 || params.n_keep as usize > full {
        return full;
    }

    params.n_keep as usize
}

/// First offset at which `needle` occurs in `haystack`
fn find_subsequence(haystack: &[TokenId], needle: &[TokenId]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
