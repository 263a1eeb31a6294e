//! Generation parameters
//!
//! Per-session sampling and context configuration. A session replaces its
//! parameters wholesale; nothing here is mutated by the generation loop.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::inference::backend::TokenId;

/// Reserved seed value meaning "generate a fresh seed"
pub const AUTO_SEED: i32 = -1;

/// `n_predict` value for an unbounded prediction budget
pub const UNBOUNDED: i32 = -1;

/// `n_keep` / `repeat_last_n` value meaning "derive it"
pub const AUTO: i32 = -1;

/// Framing inserted before each user turn in instruct mode
pub const INSTRUCTION_PREFIX: &str = "\n\n### Instruction:\n\n";

/// Framing inserted after each user turn in instruct mode
pub const RESPONSE_SUFFIX: &str = "\n\n### Response:\n\n";

/// Mirostat sampling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MirostatMode {
    #[default]
    Disabled,
    V1,
    V2,
}

impl TryFrom<u8> for MirostatMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MirostatMode::Disabled),
            1 => Ok(MirostatMode::V1),
            2 => Ok(MirostatMode::V2),
            other => Err(format!("unknown mirostat mode {other}")),
        }
    }
}

impl From<MirostatMode> for u8 {
    fn from(mode: MirostatMode) -> Self {
        match mode {
            MirostatMode::Disabled => 0,
            MirostatMode::V1 => 1,
            MirostatMode::V2 => 2,
        }
    }
}

/// Sampling strategy derived from the parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// Always pick the most likely token
    Greedy,
    /// top-k → tail-free → typical → top-p → temperature → weighted draw
    Standard,
    MirostatV1,
    MirostatV2,
}

/// Sampling and context configuration for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParameters {
    /// RNG seed, [`AUTO_SEED`] for a fresh one on every (re)seed
    pub seed: i32,
    /// Worker threads used for evaluation
    pub n_threads: usize,
    /// Prediction budget in tokens, [`UNBOUNDED`] for no limit
    pub n_predict: i32,
    /// Context window length requested from the backend
    pub n_ctx: usize,
    /// Maximum tokens evaluated per backend call
    pub n_batch: usize,
    /// Leading tokens preserved on context swap, [`AUTO`] for the whole prompt
    pub n_keep: i32,
    /// Additive bias applied to selected logits before sampling
    pub logit_bias: HashMap<TokenId, f32>,
    /// Top-k cutoff, 0 or negative for the whole vocabulary
    pub top_k: i32,
    pub top_p: f32,
    /// Tail-free sampling parameter, 1.0 disables it
    pub tfs_z: f32,
    /// Locally typical sampling parameter, 1.0 disables it
    pub typical_p: f32,
    /// Temperature, 0 or below selects greedy sampling
    pub temp: f32,
    pub repeat_penalty: f32,
    /// Lookback for penalties, [`AUTO`] for the whole context
    pub repeat_last_n: i32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub mirostat: MirostatMode,
    /// Mirostat target entropy
    pub mirostat_tau: f32,
    /// Mirostat learning rate
    pub mirostat_eta: f32,
    /// Whether the newline token takes part in repetition penalties
    pub penalize_nl: bool,
    /// Reverse prompts handing control back to the user
    pub antiprompt: Vec<String>,
    /// Text prepended to every user turn
    pub input_prefix: String,
    /// Text appended to every user turn
    pub input_suffix: String,
    pub interactive: bool,
    /// Wait for user input before sampling anything
    pub interactive_first: bool,
    /// Instruction-following mode with prefix/suffix framing
    pub instruct: bool,
    /// LoRA adapter applied on top of the model at load time
    pub lora_adapter: Option<PathBuf>,
    /// Strength of the LoRA adapter
    pub lora_scale: f32,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            seed: AUTO_SEED,
            n_threads: default_thread_count(),
            n_predict: UNBOUNDED,
            n_ctx: 512,
            n_batch: 512,
            n_keep: 0,
            logit_bias: HashMap::new(),
            top_k: 40,
            top_p: 0.95,
            tfs_z: 1.0,
            typical_p: 1.0,
            temp: 0.8,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: MirostatMode::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_nl: true,
            antiprompt: Vec::new(),
            input_prefix: String::new(),
            input_suffix: String::new(),
            interactive: false,
            interactive_first: false,
            instruct: false,
            lora_adapter: None,
            lora_scale: 1.0,
        }
    }
}

impl GenerationParameters {
    /// Selects the sampling strategy
    pub fn strategy(&self) -> SamplingStrategy {
        if self.temp <= 0.0 {
            return SamplingStrategy::Greedy;
        }
        match self.mirostat {
            MirostatMode::Disabled => SamplingStrategy::Standard,
            MirostatMode::V1 => SamplingStrategy::MirostatV1,
            MirostatMode::V2 => SamplingStrategy::MirostatV2,
        }
    }

    /// Interactive when asked for, or implied by reverse prompts / instruct mode
    pub fn is_interactive(&self) -> bool {
        self.interactive || self.interactive_first || self.instruct || !self.antiprompt.is_empty()
    }

    /// Whether the prediction budget is unbounded
    pub fn is_unbounded(&self) -> bool {
        self.n_predict == UNBOUNDED
    }

    /// Penalty lookback for a context of `n_ctx` tokens
    pub fn penalty_window(&self, n_ctx: usize) -> usize {
        if self.repeat_last_n < 0 {
            n_ctx
        } else {
            (self.repeat_last_n as usize).min(n_ctx)
        }
    }

    /// Returns the concrete seed, generating and storing one for [`AUTO_SEED`]
    pub fn resolve_seed(&mut self) -> u32 {
        if self.seed < 0 {
            let seed = random_seed();
            self.seed = seed as i32;
            seed
        } else {
            self.seed as u32
        }
    }

    /// Clamp values into usable ranges
    pub fn validate(&mut self) {
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.typical_p = self.typical_p.clamp(0.0, 1.0);
        self.tfs_z = self.tfs_z.clamp(0.0, 1.0);
        self.temp = self.temp.max(0.0);

        if self.n_threads == 0 {
            self.n_threads = default_thread_count();
        }

        if self.n_ctx < 8 {
            self.n_ctx = 512;
        }

        if self.n_batch == 0 {
            self.n_batch = 512;
        }
        self.n_batch = self.n_batch.min(self.n_ctx);

        if self.n_predict < UNBOUNDED {
            self.n_predict = UNBOUNDED;
        }

        self.antiprompt.retain(|a| !a.is_empty());

        if self
            .lora_adapter
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.lora_adapter = None;
        }
        if !self.lora_scale.is_finite() {
            self.lora_scale = 1.0;
        }
    }
}

/// Fresh seed from system entropy, kept within the non-negative `i32` range
pub fn random_seed() -> u32 {
    rand::random::<u32>() & 0x7fff_ffff
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(4)
}
