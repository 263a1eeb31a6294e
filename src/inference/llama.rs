//! llama.cpp backend via llama-cpp-2
//!
//! Since llama-cpp-2 contexts contain raw pointers that are not `Send`, a
//! [`LlamaCppBackend`] is always created by [`LlamaCppLoader`] on the
//! session's worker thread and never leaves it. Thread count, batch size and
//! the LoRA adapter are fixed when the context is created.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaLoraAdapter, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;

use crate::inference::backend::{Backend, BackendError, BackendLoader, TokenId};
use crate::inference::model::validate_gguf;
use crate::inference::params::GenerationParameters;

/// llama.cpp may only be initialised once per process
static LLAMA_BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn shared_backend() -> Result<&'static LlamaBackend, BackendError> {
    LLAMA_BACKEND.get_or_try_init(|| {
        let backend = LlamaBackend::init().map_err(|e| BackendError::Load(e.to_string()))?;
        tracing::info!("LlamaBackend initialized");
        Ok(backend)
    })
}

/// Loads GGUF models with fixed GPU offload settings
#[derive(Debug, Clone, Default)]
pub struct LlamaCppLoader {
    /// Layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
}

impl LlamaCppLoader {
    pub fn new(gpu_layers: u32) -> Self {
        Self { gpu_layers }
    }
}

impl BackendLoader for LlamaCppLoader {
    type Backend = LlamaCppBackend;

    fn load(
        &self,
        model_path: &Path,
        params: &GenerationParameters,
    ) -> Result<LlamaCppBackend, BackendError> {
        let header = validate_gguf(model_path).map_err(|e| BackendError::Load(e.to_string()))?;
        tracing::debug!(
            version = header.version,
            tensors = header.tensor_count,
            "GGUF validation passed for {:?}",
            model_path
        );
        LlamaCppBackend::load(model_path, self.gpu_layers, params)
    }
}

/// One model with one context.
///
/// Field ordering matters: the context borrows the boxed model and is
/// declared first so it drops first. The LoRA adapter belongs to the model
/// and is dropped before it.
pub struct LlamaCppBackend {
    ctx: LlamaContext<'static>,
    _lora: Option<LlamaLoraAdapter>,
    model: Box<LlamaModel>,
    logits: Vec<f32>,
}

impl LlamaCppBackend {
    pub fn load(
        path: &Path,
        gpu_layers: u32,
        params: &GenerationParameters,
    ) -> Result<Self, BackendError> {
        let backend = shared_backend()?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = Box::new(
            LlamaModel::load_from_file(backend, path, &model_params)
                .map_err(|e| BackendError::Load(e.to_string()))?,
        );

        let n_ctx = NonZeroU32::new(params.n_ctx as u32);
        let threads = params.n_threads as i32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(n_ctx)
            .with_n_batch(params.n_batch as u32)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        // SAFETY: the model is boxed so its address is stable, and it is
        // stored next to the context which is dropped before it.
        let ctx = {
            let model_ref: &'static LlamaModel = unsafe { &*(&*model as *const LlamaModel) };
            model_ref
                .new_context(backend, ctx_params)
                .map_err(|e| BackendError::Load(format!("context: {}", e)))?
        };

        let lora = match &params.lora_adapter {
            Some(adapter_path) => {
                let mut adapter = model.lora_adapter_init(adapter_path).map_err(|e| {
                    BackendError::Load(format!(
                        "LoRA adapter {}: {}",
                        adapter_path.display(),
                        e
                    ))
                })?;
                ctx.lora_adapter_set(&mut adapter, params.lora_scale)
                    .map_err(|e| BackendError::Load(format!("apply LoRA adapter: {}", e)))?;
                tracing::info!(
                    adapter = %adapter_path.display(),
                    scale = params.lora_scale,
                    "LoRA adapter applied"
                );
                Some(adapter)
            }
            None => None,
        };

        tracing::info!(
            path = %path.display(),
            n_ctx = ctx.n_ctx(),
            vocab = model.n_vocab(),
            params = model.n_params(),
            "Model loaded"
        );

        let vocab = model.n_vocab().max(0) as usize;
        Ok(Self {
            ctx,
            _lora: lora,
            model,
            logits: vec![0.0; vocab],
        })
    }
}

impl Backend for LlamaCppBackend {
    fn context_length(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn vocab_size(&self) -> usize {
        self.model.n_vocab().max(0) as usize
    }

    fn eos_token(&self) -> TokenId {
        self.model.token_eos().0
    }

    fn newline_token(&self) -> TokenId {
        self.model.token_nl().0
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn batch_size(&self) -> usize {
        self.ctx.n_batch() as usize
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        let bos = if add_bos { AddBos::Always } else { AddBos::Never };
        match self.model.str_to_token(text, bos) {
            Ok(tokens) => tokens.into_iter().map(|t| t.0).collect(),
            Err(e) => {
                tracing::warn!("Tokenization failed: {}", e);
                Vec::new()
            }
        }
    }

    fn detokenize(&self, token: TokenId) -> Vec<u8> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .unwrap_or_else(|e| {
                tracing::warn!(token, "Failed to convert token to bytes: {}", e);
                Vec::new()
            })
    }

    fn evaluate(
        &mut self,
        tokens: &[TokenId],
        past_count: usize,
        _n_threads: usize,
    ) -> Result<(), BackendError> {
        if tokens.is_empty() {
            return Ok(());
        }
        if tokens.len() > self.batch_size() {
            return Err(BackendError::Eval(format!(
                "batch of {} tokens exceeds n_batch {}",
                tokens.len(),
                self.batch_size()
            )));
        }

        // Anything beyond past_count is stale after a context swap or restore
        self.ctx
            .clear_kv_cache_seq(Some(0), Some(past_count as u32), None)
            .map_err(|e| BackendError::Eval(format!("kv cache: {}", e)))?;

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, &token) in tokens.iter().enumerate() {
            batch
                .add(LlamaToken(token), (past_count + i) as i32, &[0], i == last)
                .map_err(|e| BackendError::Eval(format!("batch add: {}", e)))?;
        }

        self.ctx
            .decode(&mut batch)
            .map_err(|e| BackendError::Eval(format!("decode: {}", e)))?;

        self.logits.clear();
        self.logits
            .extend_from_slice(self.ctx.get_logits_ith(last as i32));
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn state_size(&self) -> usize {
        self.ctx.get_state_size()
    }

    fn copy_state(&self) -> Vec<u8> {
        let mut state = vec![0u8; self.ctx.get_state_size()];
        // SAFETY: the buffer is exactly the size llama.cpp reports for its state
        let written = unsafe { self.ctx.copy_state_data(state.as_mut_ptr()) };
        state.truncate(written);
        state
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), BackendError> {
        // SAFETY: the bytes were produced by copy_state on a context of the same model
        let read = unsafe { self.ctx.set_state_data(state) };
        if read != state.len() {
            return Err(BackendError::State(format!(
                "restored {} of {} state bytes",
                read,
                state.len()
            )));
        }
        Ok(())
    }
}
