//! Streaming output
//!
//! Tokens and status changes flow from a session's worker thread to the UI
//! through an [`EventSink`]. Calls are fire-and-forget and must not block.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Lifecycle notifications emitted by a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Tokenizing,
    Generating,
    WaitingForInput,
    Paused,
    Resumed,
    /// The last reply is being discarded and produced again
    Regenerating,
    Stopped,
}

/// Receiver of session output
pub trait EventSink: Send + Sync {
    fn on_token_produced(&self, slot: usize, text: &str);

    fn on_status(&self, slot: usize, status: StatusEvent);

    fn on_error(&self, slot: usize, message: &str);
}

/// A single event as delivered by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A generated text fragment
    Token { slot: usize, text: String },
    /// A lifecycle change
    Status { slot: usize, status: StatusEvent },
    /// A reported failure
    Error { slot: usize, message: String },
}

impl SessionEvent {
    /// Character slot the event belongs to
    pub fn slot(&self) -> usize {
        match self {
            SessionEvent::Token { slot, .. }
            | SessionEvent::Status { slot, .. }
            | SessionEvent::Error { slot, .. } => *slot,
        }
    }

    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, SessionEvent::Token { .. })
    }

    /// Returns true if the run has ended
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            SessionEvent::Status {
                status: StatusEvent::Stopped,
                ..
            }
        )
    }

    /// Extracts the token text if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            SessionEvent::Token { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Sink forwarding events into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        // Receiver dropped means nobody is listening anymore
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

impl EventSink for ChannelSink {
    fn on_token_produced(&self, slot: usize, text: &str) {
        self.send(SessionEvent::Token {
            slot,
            text: text.to_string(),
        });
    }

    fn on_status(&self, slot: usize, status: StatusEvent) {
        self.send(SessionEvent::Status { slot, status });
    }

    fn on_error(&self, slot: usize, message: &str) {
        self.send(SessionEvent::Error {
            slot,
            message: message.to_string(),
        });
    }
}

/// Reassembles token pieces into complete UTF-8 text.
///
/// Multi-byte characters split across tokens are held back until the
/// remaining bytes arrive.
#[derive(Debug, Default)]
pub struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes and returns whatever now forms valid text
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let valid_len = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Invalid sequence, not merely incomplete: give up on it
            Err(e) if e.error_len().is_some() => return self.flush(),
            Err(e) => e.valid_up_to(),
        };

        if valid_len == 0 {
            return None;
        }
        let rest = self.pending.split_off(valid_len);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        Some(text)
    }

    /// Emits any held-back bytes, replacing incomplete sequences
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}
