//! Token history ring
//!
//! Fixed-capacity FIFO of the most recently processed tokens. Feeds the
//! repetition penalties, reverse-prompt detection and context-swap recovery.

use std::collections::VecDeque;

use crate::inference::backend::TokenId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRing {
    tokens: VecDeque<TokenId>,
    capacity: usize,
}

impl TokenRing {
    /// Creates an empty ring holding at most `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Appends a token, evicting the oldest one when full
    pub fn push(&mut self, token: TokenId) {
        if self.capacity == 0 {
            return;
        }
        if self.tokens.len() == self.capacity {
            self.tokens.pop_front();
        }
        self.tokens.push_back(token);
    }

    pub fn extend<I: IntoIterator<Item = TokenId>>(&mut self, tokens: I) {
        for token in tokens {
            self.push(token);
        }
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    /// The last `n` tokens, oldest first
    pub fn tail(&self, n: usize) -> Vec<TokenId> {
        let start = self.tokens.len().saturating_sub(n);
        self.tokens.range(start..).copied().collect()
    }

    /// Up to `count` tokens ending `skip` tokens before the newest one, oldest first
    pub fn tail_before(&self, skip: usize, count: usize) -> Vec<TokenId> {
        let end = self.tokens.len().saturating_sub(skip);
        let start = end.saturating_sub(count);
        self.tokens.range(start..end).copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenId> {
        self.tokens.iter()
    }
}
