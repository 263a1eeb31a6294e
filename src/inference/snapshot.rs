//! Regeneration checkpoints
//!
//! A snapshot is a value copy of everything the generation loop needs to
//! rewind: serialized backend state, the sampler RNG and mirostat feedback,
//! the resident count, the token ring and the remaining budget. It also keeps
//! the text that was about to be processed so it can be queued again.

use rand::rngs::StdRng;

use crate::inference::backend::TokenId;
use crate::inference::ring::TokenRing;

/// What a snapshot was captured in front of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Before the initial prompt was evaluated
    Prompt,
    /// Before a queued user turn was consumed. `prefixed` records whether the
    /// turn was framed with the instruction prefix.
    UserTurn { prefixed: bool },
}

#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub kind: SnapshotKind,
    /// Raw text queued right after the capture point
    pub text: String,
    pub backend_state: Vec<u8>,
    pub rng: StdRng,
    pub mirostat_mu: f32,
    pub past_count: usize,
    pub remaining: i64,
    pub ring: TokenRing,
    /// Tokens already in the ring but not yet evaluated
    pub batch: Vec<TokenId>,
    /// Replies produced before the capture point
    pub replies: usize,
}

impl StateSnapshot {
    /// Size of the captured backend state in bytes
    pub fn state_len(&self) -> usize {
        self.backend_state.len()
    }
}
