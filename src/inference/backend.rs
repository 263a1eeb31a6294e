//! Backend adapter
//!
//! The seam between the generation session and a loaded language model.
//! A backend owns one model instance with a single running context; the
//! session drives it through tokenization, forward evaluation and
//! opaque state save/restore.

use std::path::Path;

use thiserror::Error;

use crate::inference::params::GenerationParameters;

/// Token identifier as understood by the backend vocabulary
pub type TokenId = i32;

/// Errors raised by a backend adapter
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Failed to evaluate tokens: {0}")]
    Eval(String),

    #[error("Failed to restore state: {0}")]
    State(String),
}

/// A loaded model instance with one running context.
///
/// Implementations are not required to be `Send`: a backend is created and
/// used on its session's worker thread only.
pub trait Backend {
    /// Maximum number of tokens the running context can hold
    fn context_length(&self) -> usize;

    /// Number of entries in the vocabulary (and in the logits vector)
    fn vocab_size(&self) -> usize;

    /// End-of-sequence token
    fn eos_token(&self) -> TokenId;

    /// Token representing a single newline
    fn newline_token(&self) -> TokenId;

    /// Whether `token` ends generation (end of sequence or end of turn)
    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == self.eos_token()
    }

    /// Most tokens one [`Backend::evaluate`] call accepts, fixed at load
    fn batch_size(&self) -> usize;

    /// Converts text to tokens, optionally prefixing the beginning-of-sequence marker.
    ///
    /// Tokenization is total: unrepresentable input yields an empty vector.
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId>;

    /// Raw bytes of a single token's text piece (may be a partial UTF-8 sequence)
    fn detokenize(&self, token: TokenId) -> Vec<u8>;

    /// Evaluates `tokens` at positions `past_count..past_count + tokens.len()`.
    ///
    /// Anything resident at or beyond `past_count` is discarded first. On
    /// success the logits for the last token are available from [`Backend::logits`].
    /// `n_threads` is advisory; a backend may keep the count it was loaded with.
    fn evaluate(
        &mut self,
        tokens: &[TokenId],
        past_count: usize,
        n_threads: usize,
    ) -> Result<(), BackendError>;

    /// Logits produced by the most recent evaluation, sized to the vocabulary
    fn logits(&self) -> &[f32];

    /// Size in bytes of the serialized context state
    fn state_size(&self) -> usize;

    /// Serialized copy of the context state
    fn copy_state(&self) -> Vec<u8>;

    /// Restores a state previously produced by [`Backend::copy_state`]
    fn restore_state(&mut self, state: &[u8]) -> Result<(), BackendError>;
}

/// Creates backends for sessions.
///
/// `load` runs on the worker thread that will own the backend.
pub trait BackendLoader: Send + Sync + 'static {
    type Backend: Backend;

    fn load(
        &self,
        model_path: &Path,
        params: &GenerationParameters,
    ) -> Result<Self::Backend, BackendError>;
}
