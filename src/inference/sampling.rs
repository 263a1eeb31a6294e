//! Candidate-level sampling kernels
//!
//! Penalties, truncation samplers and token selection over a candidate list
//! built from raw logits. Randomness comes from a caller-owned [`StdRng`] so a
//! session can checkpoint it alongside the backend state.

use rand::rngs::StdRng;
use rand::Rng;

use crate::inference::backend::TokenId;

/// Mirostat v1 sample size for estimating the Zipf exponent
pub const MIROSTAT_M: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Candidate tokens for one sampling step
#[derive(Debug, Clone)]
pub struct Candidates {
    data: Vec<TokenData>,
    sorted: bool,
}

impl Candidates {
    /// One candidate per vocabulary entry, in id order
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    /// Overwrites the logit of `id`, if still present
    pub fn set_logit(&mut self, id: TokenId, logit: f32) {
        if let Some(candidate) = self.data.iter_mut().find(|c| c.id == id) {
            candidate.logit = logit;
        }
    }

    /// Logit of `id`, if still present
    pub fn logit(&self, id: TokenId) -> Option<f32> {
        self.data.iter().find(|c| c.id == id).map(|c| c.logit)
    }

    fn sort_by_logit(&mut self) {
        if !self.sorted {
            self.data
                .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
            self.sorted = true;
        }
    }

    /// Sorts by descending logit and fills normalized probabilities
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort_by_logit();
        let max = self.data[0].logit;
        let mut sum = 0.0;
        for c in &mut self.data {
            c.p = (c.logit - max).exp();
            sum += c.p;
        }
        if sum > 0.0 {
            for c in &mut self.data {
                c.p /= sum;
            }
        }
    }

    /// Divides positive and multiplies negative logits of recently seen tokens
    pub fn apply_repetition_penalty(&mut self, last_tokens: &[TokenId], penalty: f32) {
        if last_tokens.is_empty() || penalty == 1.0 {
            return;
        }
        for c in &mut self.data {
            if last_tokens.contains(&c.id) {
                if c.logit <= 0.0 {
                    c.logit *= penalty;
                } else {
                    c.logit /= penalty;
                }
            }
        }
        self.sorted = false;
    }

    /// Subtracts `count * alpha_frequency + alpha_presence` for every seen token
    pub fn apply_frequency_presence_penalty(
        &mut self,
        last_tokens: &[TokenId],
        alpha_frequency: f32,
        alpha_presence: f32,
    ) {
        if last_tokens.is_empty() || (alpha_frequency == 0.0 && alpha_presence == 0.0) {
            return;
        }
        let mut counts = std::collections::HashMap::new();
        for token in last_tokens {
            *counts.entry(*token).or_insert(0usize) += 1;
        }
        for c in &mut self.data {
            if let Some(&count) = counts.get(&c.id) {
                c.logit -= count as f32 * alpha_frequency + alpha_presence;
            }
        }
        self.sorted = false;
    }

    /// Keeps the `k` most likely candidates (at least `min_keep`)
    pub fn top_k(&mut self, k: usize, min_keep: usize) {
        let k = k.max(min_keep).min(self.data.len());
        self.sort_by_logit();
        self.data.truncate(k);
    }

    /// Tail-free sampling: cut where the second derivative of the sorted
    /// probabilities has accumulated `z` of its mass
    pub fn tail_free(&mut self, z: f32, min_keep: usize) {
        if z >= 1.0 || self.data.len() <= 2 {
            return;
        }
        self.softmax();

        let first: Vec<f32> = self.data.windows(2).map(|w| w[0].p - w[1].p).collect();
        let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
        let sum: f32 = second.iter().sum();
        if sum > 0.0 {
            for d in &mut second {
                *d /= sum;
            }
        }

        let mut cum = 0.0;
        let mut last_idx = self.data.len();
        for (i, d) in second.iter().enumerate() {
            cum += d;
            if cum > z && i >= min_keep {
                last_idx = i;
                break;
            }
        }
        self.data.truncate(last_idx.max(min_keep).max(1));
    }

    /// Locally typical sampling: keep tokens whose surprise is closest to the entropy
    pub fn typical(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 || self.data.is_empty() {
            return;
        }
        self.softmax();

        let entropy: f32 = self
            .data
            .iter()
            .filter(|c| c.p > 0.0)
            .map(|c| -c.p * c.p.ln())
            .sum();

        let mut order: Vec<(usize, f32)> = self
            .data
            .iter()
            .enumerate()
            .map(|(i, c)| (i, (-c.p.ln() - entropy).abs()))
            .collect();
        order.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut cum = 0.0;
        let mut last_idx = order.len();
        for (i, (idx, _)) in order.iter().enumerate() {
            cum += self.data[*idx].p;
            if cum > p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }

        self.data = order[..last_idx]
            .iter()
            .map(|(idx, _)| self.data[*idx])
            .collect();
        self.sorted = false;
    }

    /// Nucleus sampling: keep the smallest prefix with cumulative probability >= `p`
    pub fn top_p(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 || self.data.is_empty() {
            return;
        }
        self.softmax();

        let mut cum = 0.0;
        let mut last_idx = self.data.len();
        for (i, c) in self.data.iter().enumerate() {
            cum += c.p;
            if cum >= p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }
        self.data.truncate(last_idx);
    }

    pub fn temperature(&mut self, temp: f32) {
        for c in &mut self.data {
            c.logit /= temp;
        }
    }

    /// Most likely candidate
    pub fn sample_greedy(&self) -> TokenId {
        self.data
            .iter()
            .max_by(|a, b| a.logit.partial_cmp(&b.logit).unwrap_or(std::cmp::Ordering::Equal))
            .map(|c| c.id)
            .unwrap_or(0)
    }

    /// Weighted draw according to the softmax distribution
    pub fn sample(&mut self, rng: &mut StdRng) -> TokenId {
        self.draw(rng).map(|i| self.data[i].id).unwrap_or(0)
    }

    fn draw(&mut self, rng: &mut StdRng) -> Option<usize> {
        if self.data.is_empty() {
            return None;
        }
        self.softmax();
        let target: f32 = rng.gen::<f32>();
        let mut cum = 0.0;
        for (i, c) in self.data.iter().enumerate() {
            cum += c.p;
            if target < cum {
                return Some(i);
            }
        }
        Some(self.data.len() - 1)
    }

    /// Mirostat v1: estimates the Zipf exponent from the top `m` candidates,
    /// truncates to the k matching the target surprise `mu`, then updates `mu`.
    pub fn sample_mirostat(
        &mut self,
        rng: &mut StdRng,
        tau: f32,
        eta: f32,
        m: usize,
        mu: &mut f32,
    ) -> TokenId {
        if self.data.is_empty() {
            return 0;
        }
        let n = self.data.len() as f32;
        self.softmax();

        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..m.min(self.data.len().saturating_sub(1)) {
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (self.data[i].p / self.data[i + 1].p).ln();
            if b_i.is_finite() {
                sum_ti_bi += t_i * b_i;
                sum_ti_sq += t_i * t_i;
            }
        }
        let s_hat = if sum_ti_sq > 0.0 { sum_ti_bi / sum_ti_sq } else { 1.0 };

        let epsilon_hat = s_hat - 1.0;
        let k = ((epsilon_hat * 2f32.powf(*mu)) / (1.0 - n.powf(-epsilon_hat))).powf(1.0 / s_hat);
        let k = if k.is_finite() { k.max(1.0) as usize } else { 1 };

        self.top_k(k, 1);
        self.finish_mirostat(rng, tau, eta, mu)
    }

    /// Mirostat v2: drops candidates whose surprise exceeds `mu`, then updates `mu`.
    pub fn sample_mirostat_v2(
        &mut self,
        rng: &mut StdRng,
        tau: f32,
        eta: f32,
        mu: &mut f32,
    ) -> TokenId {
        if self.data.is_empty() {
            return 0;
        }
        self.softmax();

        let cutoff = self
            .data
            .iter()
            .position(|c| -c.p.log2() > *mu)
            .unwrap_or(self.data.len())
            .max(1);
        self.data.truncate(cutoff);
        self.finish_mirostat(rng, tau, eta, mu)
    }

    fn finish_mirostat(&mut self, rng: &mut StdRng, tau: f32, eta: f32, mu: &mut f32) -> TokenId {
        let Some(idx) = self.draw(rng) else {
            return 0;
        };
        let observed_surprise = -self.data[idx].p.log2();
        *mu -= eta * (observed_surprise - tau);
        self.data[idx].id
    }
}
