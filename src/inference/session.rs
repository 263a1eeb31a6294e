//! Generation session
//!
//! A [`GenerationSession`] owns one loaded backend together with everything
//! the generation loop mutates: the token ring, the conversation state and
//! the regeneration snapshots. It lives on a single worker thread. The only
//! state shared with the control thread is the [`SessionControl`] block.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::inference::backend::{Backend, TokenId};
use crate::inference::context::{resolve_keep_count, ContextWindow};
use crate::inference::error::SessionError;
use crate::inference::params::{
    random_seed, GenerationParameters, SamplingStrategy, INSTRUCTION_PREFIX, RESPONSE_SUFFIX,
};
use crate::inference::ring::TokenRing;
use crate::inference::sampling::{Candidates, MIROSTAT_M};
use crate::inference::snapshot::{SnapshotKind, StateSnapshot};
use crate::inference::streaming::{EventSink, StatusEvent, Utf8Buffer};
use crate::truncate_str;

/// Upper bound on how long a suspended loop sleeps between checks
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tokens of headroom required between the prompt and the context length
pub const PROMPT_MARGIN: usize = 4;

/// Extra ring entries detokenized beyond the longest reverse prompt
const ANTIPROMPT_SLACK: usize = 8;

/// Parameters handed to a session from the control thread
#[derive(Debug, Clone)]
pub struct ParamUpdate {
    pub params: GenerationParameters,
    /// Seed to reseed the sampler with, if the update asked for it
    pub reseed: Option<u32>,
}

#[derive(Debug, Default)]
struct Inbox {
    input: Option<String>,
    params: Option<ParamUpdate>,
}

/// What ended a wait for the user's turn
#[derive(Debug, PartialEq)]
enum Turn {
    Input(String),
    Regenerate,
    Stop,
}

/// Signals shared between a session's worker and its controller.
///
/// Flags are plain atomics. The inbox mutex is held only to copy values in or
/// out and doubles as the condition variable's lock, so every command that
/// calls [`SessionControl::wake`] is observed by a suspended loop.
#[derive(Debug, Default)]
pub struct SessionControl {
    busy: AtomicBool,
    pause: AtomicBool,
    stop: AtomicBool,
    regenerate: AtomicBool,
    inbox: Mutex<Inbox>,
    wake: Condvar,
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Claims the session for a new run.
    ///
    /// Clears leftover signals and any input that was never consumed.
    /// Returns false if a run is already in progress.
    pub fn try_begin(&self) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.stop.store(false, Ordering::SeqCst);
        self.pause.store(false, Ordering::SeqCst);
        self.regenerate.store(false, Ordering::SeqCst);
        self.lock_inbox().input = None;
        true
    }

    pub(crate) fn finish(&self) {
        self.busy.store(false, Ordering::SeqCst);
        self.wake();
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn request_resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.wake();
    }

    /// Pause is cleared first so a paused loop can observe the stop
    pub fn request_stop(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn request_regenerate(&self) {
        self.regenerate.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Replaces any input that has not been consumed yet
    pub fn submit_input(&self, text: String) {
        let replaced = self.lock_inbox().input.replace(text).is_some();
        if replaced {
            debug!("Unconsumed input replaced");
        }
        self.wake();
    }

    pub fn submit_params(&self, update: ParamUpdate) {
        self.lock_inbox().params = Some(update);
        self.wake();
    }

    fn take_regenerate(&self) -> bool {
        self.regenerate.swap(false, Ordering::SeqCst)
    }

    fn take_params(&self) -> Option<ParamUpdate> {
        self.lock_inbox().params.take()
    }

    fn wake(&self) {
        let _inbox = self.lock_inbox();
        self.wake.notify_all();
    }

    /// Waits until the busy flag drops or `timeout` elapses
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut inbox = self.lock_inbox();
        while self.is_busy() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            inbox = match self.wake.wait_timeout(inbox, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn lock_inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Suspends the caller while `blocked` holds
    fn park_while(&self, mut blocked: impl FnMut(&mut Inbox) -> bool) {
        let mut inbox = self.lock_inbox();
        while blocked(&mut inbox) {
            inbox = match self.wake.wait_timeout(inbox, POLL_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn wait_pause(&self) {
        self.park_while(|_| self.is_paused() && !self.is_stop_requested());
    }

    fn wait_turn(&self) -> Turn {
        let mut turn = None;
        self.park_while(|inbox| {
            if self.is_stop_requested() {
                turn = Some(Turn::Stop);
            } else if self.take_regenerate() {
                turn = Some(Turn::Regenerate);
            } else if let Some(text) = inbox.input.take() {
                turn = Some(Turn::Input(text));
            }
            turn.is_none()
        });
        turn.unwrap_or(Turn::Stop)
    }
}

/// Mutable per-run loop state
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    /// Tokens resident in the backend context
    pub past_count: usize,
    /// Queued prompt or user-turn tokens not yet handed to a batch
    pub pending: VecDeque<TokenId>,
    /// Outstanding prediction budget, negative when unbounded
    pub remaining: i64,
    /// Waiting for the user instead of sampling
    pub interacting: bool,
    /// Queued tokens are an injected reverse prompt and must be echoed
    pub echo_pending: bool,
    /// The reply being sampled has already been counted
    pub in_reply: bool,
    pub tokens_generated: usize,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub tokens_generated: usize,
}

/// Clears busy and reports `Stopped` however a run exits
struct BusyGuard {
    slot: usize,
    control: Arc<SessionControl>,
    sink: Arc<dyn EventSink>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.control.finish();
        self.sink.on_status(self.slot, StatusEvent::Stopped);
    }
}

pub struct GenerationSession<B: Backend> {
    slot: usize,
    backend: B,
    params: GenerationParameters,
    speaker_tags: Vec<String>,
    auto_keep: bool,
    control: Arc<SessionControl>,
    sink: Arc<dyn EventSink>,
    rng: StdRng,
    mirostat_mu: f32,
    ring: TokenRing,
    state: ConversationState,
    initial: Option<StateSnapshot>,
    latest: Option<StateSnapshot>,
    replies: usize,
}

impl<B: Backend> GenerationSession<B> {
    pub fn new(
        slot: usize,
        backend: B,
        mut params: GenerationParameters,
        control: Arc<SessionControl>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let seed = params.resolve_seed();
        info!(slot, seed, "Session created");
        let n_ctx = backend.context_length();
        Self {
            slot,
            backend,
            mirostat_mu: 2.0 * params.mirostat_tau,
            params,
            speaker_tags: Vec::new(),
            auto_keep: false,
            control,
            sink,
            rng: StdRng::seed_from_u64(u64::from(seed)),
            ring: TokenRing::new(n_ctx),
            state: ConversationState::default(),
            initial: None,
            latest: None,
            replies: 0,
        }
    }

    /// Speaker tags scanned for when the keep count is derived automatically
    pub fn with_speaker_tags(mut self, tags: Vec<String>, auto_keep: bool) -> Self {
        self.speaker_tags = tags;
        self.auto_keep = auto_keep;
        self
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn params(&self) -> &GenerationParameters {
        &self.params
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn ring(&self) -> &TokenRing {
        &self.ring
    }

    pub fn replies(&self) -> usize {
        self.replies
    }

    pub fn initial_snapshot(&self) -> Option<&StateSnapshot> {
        self.initial.as_ref()
    }

    pub fn latest_snapshot(&self) -> Option<&StateSnapshot> {
        self.latest.as_ref()
    }

    /// Runs a prompt to completion, claiming the session first
    pub fn run(&mut self, prompt: &str) -> Result<RunReport, SessionError> {
        if !self.control.try_begin() {
            return Err(SessionError::AlreadyBusy);
        }
        self.run_claimed(prompt)
    }

    /// Runs a prompt on a session already claimed with [`SessionControl::try_begin`]
    pub(crate) fn run_claimed(&mut self, prompt: &str) -> Result<RunReport, SessionError> {
        let _busy = BusyGuard {
            slot: self.slot,
            control: self.control.clone(),
            sink: self.sink.clone(),
        };

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", slot = self.slot, %run_id);
        let _enter = span.enter();

        match self.generate(prompt) {
            Ok(outcome) => {
                info!(
                    ?outcome,
                    tokens = self.state.tokens_generated,
                    "Generation finished"
                );
                Ok(RunReport {
                    run_id,
                    outcome,
                    tokens_generated: self.state.tokens_generated,
                })
            }
            Err(e) => {
                error!("Generation failed: {}", e);
                self.sink.on_error(self.slot, &e.to_string());
                Err(e)
            }
        }
    }

    fn generate(&mut self, prompt: &str) -> Result<RunOutcome, SessionError> {
        self.apply_param_update();
        self.sink.on_status(self.slot, StatusEvent::Tokenizing);

        let prompt_tokens = self.tokenize_prompt(prompt);
        let n_ctx = self.backend.context_length();
        let max = n_ctx.saturating_sub(PROMPT_MARGIN);
        if prompt_tokens.len() > max {
            return Err(SessionError::PromptTooLong {
                tokens: prompt_tokens.len(),
                max,
            });
        }

        let tags = self.tokenized_speaker_tags();
        let keep = resolve_keep_count(&prompt_tokens, &self.params, tags.as_deref());
        let window = ContextWindow::new(n_ctx, keep);
        debug!(params = ?self.params, "Sampling parameters");
        info!(
            prompt_tokens = prompt_tokens.len(),
            n_ctx = window.context_length(),
            n_keep = window.keep_count(),
            n_batch = self.batch_limit(),
            "Prompt tokenized"
        );
        if keep > 0 {
            debug!(static_prompt = %truncate_str(&self.detokenize(&prompt_tokens[..keep]), 120), "Kept across context swaps");
        }

        self.reset_conversation(n_ctx);
        self.initial = Some(self.capture(SnapshotKind::Prompt, prompt, &[]));
        self.state.pending.extend(prompt_tokens);

        self.sink.on_status(self.slot, StatusEvent::Generating);
        self.generation_loop(&window)
    }

    fn generation_loop(&mut self, window: &ContextWindow) -> Result<RunOutcome, SessionError> {
        let mut batch: Vec<TokenId> = Vec::new();
        let mut utf8 = Utf8Buffer::new();

        loop {
            let interactive = self.params.is_interactive();
            if self.state.remaining == 0 && !interactive {
                break;
            }
            if self.control.is_stop_requested() {
                self.flush(&mut utf8);
                return Ok(RunOutcome::Cancelled);
            }

            if self.control.is_paused() {
                self.flush(&mut utf8);
                self.sink.on_status(self.slot, StatusEvent::Paused);
                self.control.wait_pause();
                if self.control.is_stop_requested() {
                    return Ok(RunOutcome::Cancelled);
                }
                self.sink.on_status(self.slot, StatusEvent::Resumed);
            }

            if self.control.take_regenerate() {
                self.flush(&mut utf8);
                self.regenerate(&mut batch)?;
                continue;
            }
            self.apply_param_update();

            if !batch.is_empty() {
                if let Some(swap) =
                    window.recover(&mut self.state.past_count, &mut batch, &self.ring)
                {
                    debug!(
                        discarded = swap.discarded,
                        recovered = swap.recovered,
                        past_count = swap.past_count,
                        "Context swap"
                    );
                }
                self.evaluate(&batch)?;
            }
            batch.clear();

            let echo;
            if self.state.pending.is_empty() && !self.state.interacting {
                let token = self.sample_next(interactive);
                batch.push(token);
                self.state.remaining -= 1;
                self.state.tokens_generated += 1;
                if !self.state.in_reply {
                    self.replies += 1;
                    self.state.in_reply = true;
                }
                echo = true;
            } else {
                echo = self.state.echo_pending;
                while let Some(token) = self.state.pending.pop_front() {
                    batch.push(token);
                    self.ring.push(token);
                    if batch.len() >= self.batch_limit() {
                        break;
                    }
                }
                if self.state.pending.is_empty() {
                    self.state.echo_pending = false;
                }
            }

            if echo {
                for &token in &batch {
                    if self.backend.is_end_of_generation(token) {
                        continue;
                    }
                    let piece = self.backend.detokenize(token);
                    if let Some(text) = utf8.push(&piece) {
                        self.sink.on_token_produced(self.slot, &text);
                    }
                }
            }

            if interactive && self.state.pending.is_empty() {
                let mut at_antiprompt = false;
                if self.ends_with_antiprompt() {
                    self.state.interacting = true;
                    at_antiprompt = true;
                }

                if self.state.past_count > 0 && self.state.interacting {
                    self.flush(&mut utf8);
                    self.sink.on_status(self.slot, StatusEvent::WaitingForInput);
                    match self.control.wait_turn() {
                        Turn::Stop => return Ok(RunOutcome::Cancelled),
                        Turn::Regenerate => {
                            self.regenerate(&mut batch)?;
                            continue;
                        }
                        Turn::Input(text) => {
                            self.accept_turn(text, at_antiprompt, &batch);
                            self.sink.on_status(self.slot, StatusEvent::Generating);
                        }
                    }
                }

                if self.state.past_count > 0 {
                    self.state.interacting = false;
                }
            }

            if batch
                .last()
                .is_some_and(|&t| self.backend.is_end_of_generation(t))
            {
                if self.params.instruct {
                    self.state.interacting = true;
                } else {
                    info!("End of text");
                    break;
                }
            }

            if interactive && self.state.remaining <= 0 && !self.params.is_unbounded() {
                self.state.remaining = i64::from(self.params.n_predict);
                self.state.interacting = true;
            }
        }

        self.flush(&mut utf8);
        Ok(RunOutcome::Completed)
    }

    fn flush(&self, utf8: &mut Utf8Buffer) {
        if let Some(text) = utf8.flush() {
            self.sink.on_token_produced(self.slot, &text);
        }
    }

    fn tokenize_prompt(&self, prompt: &str) -> Vec<TokenId> {
        // Leading space matches how the model was trained to see text
        self.backend.tokenize(&format!(" {}", prompt), true)
    }

    fn tokenized_speaker_tags(&self) -> Option<Vec<Vec<TokenId>>> {
        if !self.auto_keep || self.speaker_tags.is_empty() {
            return None;
        }
        Some(
            self.speaker_tags
                .iter()
                .map(|tag| self.backend.tokenize(tag, false))
                .collect(),
        )
    }

    fn detokenize(&self, tokens: &[TokenId]) -> String {
        let bytes: Vec<u8> = tokens
            .iter()
            .flat_map(|&t| self.backend.detokenize(t))
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn reset_conversation(&mut self, n_ctx: usize) {
        self.ring = TokenRing::new(n_ctx);
        self.state = ConversationState {
            remaining: i64::from(self.params.n_predict),
            interacting: self.params.interactive_first,
            ..ConversationState::default()
        };
        self.mirostat_mu = 2.0 * self.params.mirostat_tau;
        self.replies = 0;
        self.latest = None;
    }

    /// Batch length honoured by both the session and the loaded context
    fn batch_limit(&self) -> usize {
        self.params.n_batch.min(self.backend.batch_size()).max(1)
    }

    fn evaluate(&mut self, batch: &[TokenId]) -> Result<(), SessionError> {
        for chunk in batch.chunks(self.batch_limit()) {
            self.backend
                .evaluate(chunk, self.state.past_count, self.params.n_threads)
                .map_err(|e| SessionError::BackendEvalFailure(e.to_string()))?;
            self.state.past_count += chunk.len();
        }
        Ok(())
    }

    fn sample_next(&mut self, interactive: bool) -> TokenId {
        let params = &self.params;
        let n_ctx = self.backend.context_length();
        let newline = self.backend.newline_token();

        let mut logits = self.backend.logits().to_vec();
        for (&token, &bias) in &params.logit_bias {
            if let Some(logit) = usize::try_from(token).ok().and_then(|i| logits.get_mut(i)) {
                *logit += bias;
            }
        }
        let newline_logit = usize::try_from(newline)
            .ok()
            .and_then(|i| logits.get(i))
            .copied();

        let mut candidates = Candidates::from_logits(&logits);
        let window = self.ring.tail(params.penalty_window(n_ctx));
        candidates.apply_repetition_penalty(&window, params.repeat_penalty);
        candidates.apply_frequency_presence_penalty(
            &window,
            params.frequency_penalty,
            params.presence_penalty,
        );
        if !params.penalize_nl {
            if let Some(logit) = newline_logit {
                candidates.set_logit(newline, logit);
            }
        }

        let mut token = match params.strategy() {
            SamplingStrategy::Greedy => candidates.sample_greedy(),
            SamplingStrategy::MirostatV1 => {
                candidates.temperature(params.temp);
                candidates.sample_mirostat(
                    &mut self.rng,
                    params.mirostat_tau,
                    params.mirostat_eta,
                    MIROSTAT_M,
                    &mut self.mirostat_mu,
                )
            }
            SamplingStrategy::MirostatV2 => {
                candidates.temperature(params.temp);
                candidates.sample_mirostat_v2(
                    &mut self.rng,
                    params.mirostat_tau,
                    params.mirostat_eta,
                    &mut self.mirostat_mu,
                )
            }
            SamplingStrategy::Standard => {
                let top_k = if params.top_k <= 0 {
                    candidates.len()
                } else {
                    params.top_k as usize
                };
                candidates.top_k(top_k, 1);
                candidates.tail_free(params.tfs_z, 1);
                candidates.typical(params.typical_p, 1);
                candidates.top_p(params.top_p, 1);
                candidates.temperature(params.temp);
                candidates.sample(&mut self.rng)
            }
        };

        if self.backend.is_end_of_generation(token) && interactive && !self.params.instruct {
            token = newline;
            if let Some(first) = self.params.antiprompt.first() {
                let injected = self.backend.tokenize(first, false);
                self.state.pending.extend(injected);
                self.state.echo_pending = true;
            }
        }

        self.ring.push(token);
        token
    }

    fn ends_with_antiprompt(&self) -> bool {
        let antiprompt = &self.params.antiprompt;
        let Some(longest) = antiprompt.iter().map(String::len).max() else {
            return false;
        };
        let tail: Vec<u8> = self
            .ring
            .tail(longest + ANTIPROMPT_SLACK)
            .into_iter()
            .flat_map(|t| self.backend.detokenize(t))
            .collect();
        antiprompt
            .iter()
            .any(|a| !a.is_empty() && tail.ends_with(a.as_bytes()))
    }

    /// Queues a user turn, checkpointing first so the reply can be redone
    fn accept_turn(&mut self, text: String, at_antiprompt: bool, batch: &[TokenId]) {
        if text.trim().is_empty() {
            debug!("Empty turn, handing control back");
            return;
        }
        let prefixed = self.params.instruct && !at_antiprompt;
        let text = if text.ends_with('\n') {
            text
        } else {
            text + "\n"
        };
        self.latest = Some(self.capture(SnapshotKind::UserTurn { prefixed }, &text, batch));
        self.state.in_reply = false;
        self.queue_turn(&text, prefixed);
    }

    fn queue_turn(&mut self, text: &str, prefixed: bool) {
        if prefixed {
            let prefix = self.backend.tokenize(INSTRUCTION_PREFIX, true);
            self.state.pending.extend(prefix);
        }

        let line = format!(
            "{}{}{}",
            self.params.input_prefix, text, self.params.input_suffix
        );
        let tokens = self.backend.tokenize(&line, false);
        self.state.remaining -= tokens.len() as i64;
        self.state.pending.extend(tokens);

        if self.params.instruct {
            let suffix = self.backend.tokenize(RESPONSE_SUFFIX, false);
            self.state.pending.extend(suffix);
        }
    }

    fn capture(&self, kind: SnapshotKind, text: &str, batch: &[TokenId]) -> StateSnapshot {
        let snapshot = StateSnapshot {
            kind,
            text: text.to_string(),
            backend_state: self.backend.copy_state(),
            rng: self.rng.clone(),
            mirostat_mu: self.mirostat_mu,
            past_count: self.state.past_count,
            remaining: self.state.remaining,
            ring: self.ring.clone(),
            batch: batch.to_vec(),
            replies: self.replies,
        };
        debug!(
            ?kind,
            bytes = snapshot.state_len(),
            past_count = snapshot.past_count,
            "Snapshot captured"
        );
        snapshot
    }

    /// Redoes the last reply in place.
    ///
    /// Rewinds to the most recent user turn, or to the prompt when the only
    /// reply so far followed the prompt itself. Either way the sampler is
    /// reseeded so the new reply differs.
    fn regenerate(&mut self, batch: &mut Vec<TokenId>) -> Result<(), SessionError> {
        let snapshot = self.latest.clone().or_else(|| self.initial.clone());
        let Some(snapshot) = snapshot else {
            warn!("Nothing to regenerate");
            return Ok(());
        };

        self.sink.on_status(self.slot, StatusEvent::Regenerating);
        self.restore(&snapshot, batch)?;

        let seed = random_seed();
        self.rng = StdRng::seed_from_u64(u64::from(seed));
        info!(seed, kind = ?snapshot.kind, replies = self.replies, "Regenerating");

        match snapshot.kind {
            SnapshotKind::Prompt => {
                self.state.interacting = self.params.interactive_first;
                self.latest = None;
                let tokens = self.tokenize_prompt(&snapshot.text);
                self.state.pending.extend(tokens);
            }
            SnapshotKind::UserTurn { prefixed } => {
                self.queue_turn(&snapshot.text, prefixed);
            }
        }

        self.sink.on_status(self.slot, StatusEvent::Generating);
        Ok(())
    }

    fn restore(
        &mut self,
        snapshot: &StateSnapshot,
        batch: &mut Vec<TokenId>,
    ) -> Result<(), SessionError> {
        self.backend.restore_state(&snapshot.backend_state)?;
        self.rng = snapshot.rng.clone();
        self.mirostat_mu = snapshot.mirostat_mu;
        self.ring = snapshot.ring.clone();
        self.state.past_count = snapshot.past_count;
        self.state.remaining = snapshot.remaining;
        self.state.pending.clear();
        self.state.interacting = false;
        self.state.echo_pending = false;
        self.state.in_reply = false;
        self.replies = snapshot.replies;
        *batch = snapshot.batch.clone();
        debug!(
            bytes = snapshot.state_len(),
            past_count = snapshot.past_count,
            "Snapshot restored"
        );
        Ok(())
    }

    fn apply_param_update(&mut self) {
        let Some(update) = self.control.take_params() else {
            return;
        };
        if update.params.n_ctx != self.params.n_ctx {
            warn!(
                n_ctx = update.params.n_ctx,
                "Context length changes take effect on the next model load"
            );
        }
        if update.params.n_batch > self.backend.batch_size() {
            warn!(
                n_batch = update.params.n_batch,
                loaded = self.backend.batch_size(),
                "Larger batch sizes take effect on the next model load"
            );
        }
        if update.params.n_threads != self.params.n_threads {
            warn!(
                n_threads = update.params.n_threads,
                "Thread count changes take effect on the next model load"
            );
        }
        if update.params.lora_adapter != self.params.lora_adapter {
            warn!("LoRA adapter changes take effect on the next model load");
        }
        self.params = update.params;
        if let Some(seed) = update.reseed {
            self.rng = StdRng::seed_from_u64(u64::from(seed));
            info!(seed, "Sampler reseeded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{byte, constant, MockBackend, RecordingSink, EOS, EOT};
    use crate::inference::params::MirostatMode;
    use rand::Rng;

    fn greedy(n_predict: i32) -> GenerationParameters {
        GenerationParameters {
            temp: 0.0,
            n_predict,
            seed: 7,
            ..GenerationParameters::default()
        }
    }

    fn session(
        backend: MockBackend,
        params: GenerationParameters,
    ) -> (GenerationSession<MockBackend>, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let session = GenerationSession::new(
            0,
            backend,
            params,
            Arc::new(SessionControl::new()),
            sink.clone(),
        );
        (session, sink)
    }

    #[test]
    fn test_bounded_run_completes() {
        let (mut session, sink) = session(MockBackend::new(64, constant('a')), greedy(5));

        let report = session.run("Hi").unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.tokens_generated, 5);
        assert_eq!(sink.text(0), "aaaaa");
        assert_eq!(
            sink.statuses(0).first(),
            Some(&StatusEvent::Tokenizing)
        );
        assert_eq!(sink.statuses(0).last(), Some(&StatusEvent::Stopped));
        assert!(!session.control.is_busy());
    }

    #[test]
    fn test_prompt_gets_leading_space_and_bos() {
        let backend = MockBackend::new(64, constant('a'));
        let log = backend.log();
        let (mut session, _sink) = session(backend, greedy(1));

        session.run("Hi").unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.evaluations[0].0, 0);
        assert_eq!(
            log.evaluations[0].1,
            vec![crate::inference::mock::BOS, byte(' '), byte('H'), byte('i')]
        );
    }

    #[test]
    fn test_prompt_too_long_is_reported() {
        let (mut session, sink) = session(MockBackend::new(16, constant('a')), greedy(5));

        let err = session.run("twenty characters!!!").unwrap_err();

        assert_eq!(err, SessionError::PromptTooLong { tokens: 22, max: 12 });
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(sink.statuses(0).last(), Some(&StatusEvent::Stopped));
        assert!(!session.control.is_busy());
    }

    #[test]
    fn test_end_of_text_terminates_non_interactive_run() {
        let script = Arc::new(|history: &[TokenId]| {
            if history.iter().filter(|&&t| t == byte('x')).count() >= 3 {
                EOS
            } else {
                byte('x')
            }
        });
        let (mut session, sink) = session(MockBackend::new(64, script), greedy(-1));

        let report = session.run("go").unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.tokens_generated, 4);
        // The end-of-text piece renders as "</s>" and must not reach the sink
        assert_eq!(sink.text(0), "xxx");
    }

    #[test]
    fn test_end_of_turn_token_terminates_run() {
        let script = Arc::new(|history: &[TokenId]| {
            if history.iter().filter(|&&t| t == byte('y')).count() >= 2 {
                EOT
            } else {
                byte('y')
            }
        });
        let (mut session, sink) = session(MockBackend::new(64, script), greedy(-1));

        let report = session.run("go").unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.tokens_generated, 3);
        assert_eq!(sink.text(0), "yy");
    }

    #[test]
    fn test_batches_respect_loaded_batch_size() {
        let backend = MockBackend::new(64, constant('a')).with_batch_limit(4);
        let log = backend.log();
        let (mut session, sink) = session(backend, greedy(3));
        session.control.submit_params(ParamUpdate {
            params: GenerationParameters {
                n_batch: 2048,
                n_threads: 3,
                ..greedy(3)
            },
            reseed: None,
        });

        // BOS + " twelve chars" is 14 tokens
        session.run("twelve chars").unwrap();

        // Load-time settings are recorded but the loaded context keeps its own
        assert_eq!(session.params().n_batch, 2048);
        assert_eq!(session.params().n_threads, 3);
        assert_eq!(sink.text(0), "aaa");
        let log = log.lock().unwrap();
        let sizes: Vec<usize> = log.evaluations.iter().map(|(_, t)| t.len()).collect();
        assert_eq!(&sizes[..4], &[4, 4, 4, 2]);
        assert!(sizes.iter().all(|&n| n <= 4));
    }

    #[test]
    fn test_regenerate_from_prompt_reseeds_sampler() {
        let mut params = greedy(4);
        params.temp = 0.8;
        let backend = MockBackend::new(64, constant('a'));
        let log = backend.log();
        let (mut session, sink) = session(backend, params);

        session.run("Hi").unwrap();
        let initial = session.initial_snapshot().unwrap().clone();

        let mut batch = Vec::new();
        session.regenerate(&mut batch).unwrap();

        // Same prompt queued again from an empty context
        let prompt: Vec<TokenId> = log.lock().unwrap().evaluations[0].1.clone();
        assert_eq!(session.state().past_count, 0);
        assert!(batch.is_empty());
        assert_eq!(session.state().pending.iter().copied().collect::<Vec<_>>(), prompt);
        assert_eq!(log.lock().unwrap().restored.last(), Some(&initial.backend_state));

        // ...but drawn with a different random stream
        let restored_draw: u64 = initial.rng.clone().gen();
        let reseeded_draw: u64 = session.rng.clone().gen();
        assert_ne!(restored_draw, reseeded_draw);
        assert_eq!(sink.count_status(0, StatusEvent::Regenerating), 1);
    }

    #[test]
    fn test_long_run_swaps_context() {
        let backend = MockBackend::new(16, constant('a'));
        let log = backend.log();
        let (mut session, sink) = session(backend, greedy(60));

        let report = session.run("Hi").unwrap();

        assert_eq!(report.tokens_generated, 60);
        assert_eq!(sink.text(0).len(), 60);
        assert!(session.ring().len() <= 16);
        // The mock rejects any overflow, so reaching here means every swap fit
        let log = log.lock().unwrap();
        assert!(log.evaluations.iter().any(|(past, batch)| *past == 1 && batch.len() > 1));
    }

    #[test]
    fn test_eval_failure_ends_run() {
        let backend = MockBackend::new(64, constant('a')).failing_after(2);
        let (mut session, sink) = session(backend, greedy(10));

        let err = session.run("Hi").unwrap_err();

        assert!(matches!(err, SessionError::BackendEvalFailure(_)));
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(sink.statuses(0).last(), Some(&StatusEvent::Stopped));
        assert!(!session.control.is_busy());
    }

    #[test]
    fn test_second_run_rejected_while_busy() {
        let (mut session, _sink) = session(MockBackend::new(64, constant('a')), greedy(1));
        assert!(session.control.try_begin());

        assert_eq!(session.run("Hi").unwrap_err(), SessionError::AlreadyBusy);
        assert!(session.control.is_busy());
    }

    #[test]
    fn test_logit_bias_overrides_model() {
        let mut params = greedy(3);
        params.logit_bias.insert(byte('b'), 30.0);
        let (mut session, sink) = session(MockBackend::new(64, constant('a')), params);

        session.run("Hi").unwrap();

        assert_eq!(sink.text(0), "bbb");
    }

    #[test]
    fn test_mirostat_updates_mu() {
        let mut params = greedy(2);
        params.temp = 0.8;
        params.mirostat = MirostatMode::V2;
        let (mut session, sink) = session(MockBackend::new(64, constant('a')), params);

        session.run("Hi").unwrap();

        assert_eq!(sink.text(0), "aa");
        // A certain token carries no surprise, so mu grows towards more candidates
        assert!(session.mirostat_mu > 2.0 * session.params().mirostat_tau);
    }

    #[test]
    fn test_initial_snapshot_is_pre_generation() {
        let (mut session, _sink) = session(MockBackend::new(64, constant('a')), greedy(3));

        session.run("Hi").unwrap();

        let initial = session.initial_snapshot().unwrap();
        assert_eq!(initial.kind, SnapshotKind::Prompt);
        assert_eq!(initial.text, "Hi");
        assert_eq!(initial.past_count, 0);
        assert!(initial.ring.is_empty());
        assert!(initial.backend_state.is_empty());
        assert_eq!(session.replies(), 1);
    }

    #[test]
    fn test_auto_keep_uses_speaker_tag() {
        let mut params = greedy(40);
        params.n_keep = crate::inference::params::AUTO;
        let backend = MockBackend::new(24, constant('a'));
        let log = backend.log();
        let (session, _sink) = session(backend, params);
        let mut session = session.with_speaker_tags(vec!["U:".to_string(), "B:".to_string()], true);

        // [BOS, ' ', 'P', 'P', 'B', ':', ...] keeps the first four tokens
        session.run("PPB: hi U:").unwrap();

        let log = log.lock().unwrap();
        assert!(log.evaluations.iter().any(|(past, _)| *past == 4));
        assert!(log.evaluations.iter().skip(1).all(|(past, _)| *past >= 4));
    }
}
