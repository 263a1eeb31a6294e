//! Deterministic backend and sink doubles for engine tests

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::inference::backend::{Backend, BackendError, BackendLoader, TokenId};
use crate::inference::params::GenerationParameters;
use crate::inference::streaming::{EventSink, StatusEvent};

pub const BOS: TokenId = 256;
pub const EOS: TokenId = 257;
/// End-of-turn marker, a second end-of-generation token
pub const EOT: TokenId = 258;
pub const NEWLINE: TokenId = b'\n' as TokenId;
const VOCAB: usize = 259;
const DEFAULT_BATCH: usize = 512;
const PEAK: f32 = 20.0;

/// Picks the next token from the resident history
pub type Script = Arc<dyn Fn(&[TokenId]) -> TokenId + Send + Sync>;

pub fn byte(c: char) -> TokenId {
    c as u8 as TokenId
}

/// Always produces `c`
pub fn constant(c: char) -> Script {
    Arc::new(move |_| byte(c))
}

/// Replays `reply` starting after every occurrence of `marker`
pub fn reply_after(marker: char, reply: &'static str) -> Script {
    let marker = byte(marker);
    Arc::new(move |history: &[TokenId]| {
        let since = history
            .iter()
            .rev()
            .position(|&t| t == marker)
            .unwrap_or(history.len());
        let bytes = reply.as_bytes();
        bytes[since % bytes.len()] as TokenId
    })
}

#[derive(Debug, Default)]
pub struct MockLog {
    /// `(past_count, tokens)` for every evaluate call
    pub evaluations: Vec<(usize, Vec<TokenId>)>,
    /// Every state handed to `restore_state`
    pub restored: Vec<Vec<u8>>,
    pub loads: usize,
}

impl MockLog {
    pub fn evaluated_text(&self) -> String {
        let bytes: Vec<u8> = self
            .evaluations
            .iter()
            .flat_map(|(_, tokens)| tokens.iter())
            .filter(|&&t| t < 256)
            .map(|&t| t as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Byte-level tokenizer over a resident-token "KV cache"
pub struct MockBackend {
    n_ctx: usize,
    n_batch: usize,
    resident: Vec<TokenId>,
    logits: Vec<f32>,
    script: Script,
    delay: Duration,
    fail_after: Option<usize>,
    log: Arc<Mutex<MockLog>>,
}

impl MockBackend {
    pub fn new(n_ctx: usize, script: Script) -> Self {
        Self {
            n_ctx,
            n_batch: DEFAULT_BATCH,
            resident: Vec::new(),
            logits: vec![0.0; VOCAB],
            script,
            delay: Duration::ZERO,
            fail_after: None,
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Rejects evaluations of more than `n_batch` tokens
    pub fn with_batch_limit(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn failing_after(mut self, evaluations: usize) -> Self {
        self.fail_after = Some(evaluations);
        self
    }

    pub fn log(&self) -> Arc<Mutex<MockLog>> {
        self.log.clone()
    }
}

impl Backend for MockBackend {
    fn context_length(&self) -> usize {
        self.n_ctx
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn eos_token(&self) -> TokenId {
        EOS
    }

    fn newline_token(&self) -> TokenId {
        NEWLINE
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS || token == EOT
    }

    fn batch_size(&self) -> usize {
        self.n_batch
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(TokenId::from));
        tokens
    }

    /// Control tokens render as text, like llama.cpp with special tokens enabled
    fn detokenize(&self, token: TokenId) -> Vec<u8> {
        match token {
            0..=255 => vec![token as u8],
            EOS => b"</s>".to_vec(),
            EOT => b"<|eot|>".to_vec(),
            _ => Vec::new(),
        }
    }

    fn evaluate(
        &mut self,
        tokens: &[TokenId],
        past_count: usize,
        _n_threads: usize,
    ) -> Result<(), BackendError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mut log = self.log.lock().unwrap();
        if self.fail_after.is_some_and(|n| log.evaluations.len() >= n) {
            return Err(BackendError::Eval("injected failure".to_string()));
        }
        if past_count > self.resident.len() {
            return Err(BackendError::Eval(format!(
                "gap: past {} with {} resident",
                past_count,
                self.resident.len()
            )));
        }
        if tokens.len() > self.n_batch {
            return Err(BackendError::Eval(format!(
                "batch of {} exceeds n_batch {}",
                tokens.len(),
                self.n_batch
            )));
        }
        if past_count + tokens.len() > self.n_ctx {
            return Err(BackendError::Eval("context overflow".to_string()));
        }
        log.evaluations.push((past_count, tokens.to_vec()));
        drop(log);

        self.resident.truncate(past_count);
        self.resident.extend_from_slice(tokens);

        let next = (self.script)(&self.resident);
        self.logits.iter_mut().for_each(|l| *l = 0.0);
        self.logits[next as usize] = PEAK;
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn state_size(&self) -> usize {
        self.resident.len() * 4
    }

    fn copy_state(&self) -> Vec<u8> {
        self.resident.iter().flat_map(|t| t.to_le_bytes()).collect()
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), BackendError> {
        if state.len() % 4 != 0 {
            return Err(BackendError::State("misaligned state".to_string()));
        }
        self.log.lock().unwrap().restored.push(state.to_vec());
        self.resident = state
            .chunks_exact(4)
            .map(|c| TokenId::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(())
    }
}

/// Loader producing [`MockBackend`]s (or failing on demand)
pub struct MockLoader {
    pub n_ctx: usize,
    pub script: Script,
    pub delay: Duration,
    pub fail: bool,
    pub log: Arc<Mutex<MockLog>>,
}

impl MockLoader {
    pub fn new(n_ctx: usize, script: Script) -> Self {
        Self {
            n_ctx,
            script,
            delay: Duration::ZERO,
            fail: false,
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }
}

impl BackendLoader for MockLoader {
    type Backend = MockBackend;

    fn load(
        &self,
        model_path: &Path,
        _params: &GenerationParameters,
    ) -> Result<MockBackend, BackendError> {
        if self.fail {
            return Err(BackendError::Load(format!("cannot load {}", model_path.display())));
        }
        self.log.lock().unwrap().loads += 1;
        let mut backend = MockBackend::new(self.n_ctx, self.script.clone()).with_delay(self.delay);
        backend.log = self.log.clone();
        Ok(backend)
    }
}

/// Sink that records everything it receives
#[derive(Default)]
pub struct RecordingSink {
    tokens: Mutex<Vec<(usize, String)>>,
    statuses: Mutex<Vec<(usize, StatusEvent)>>,
    errors: Mutex<Vec<(usize, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn text(&self, slot: usize) -> String {
        self.tokens
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, t)| t.as_str())
            .collect()
    }

    pub fn statuses(&self, slot: usize) -> Vec<StatusEvent> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, e)| *e)
            .collect()
    }

    pub fn count_status(&self, slot: usize, status: StatusEvent) -> usize {
        self.statuses(slot).iter().filter(|&&e| e == status).count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }
}

impl EventSink for RecordingSink {
    fn on_token_produced(&self, slot: usize, text: &str) {
        self.tokens.lock().unwrap().push((slot, text.to_string()));
    }

    fn on_status(&self, slot: usize, status: StatusEvent) {
        self.statuses.lock().unwrap().push((slot, status));
    }

    fn on_error(&self, slot: usize, message: &str) {
        self.errors.lock().unwrap().push((slot, message.to_string()));
    }
}

/// Polls `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
