//! Session registry
//!
//! One [`SessionController`] per character slot. A reload tears every
//! session down gracefully before building the new set; a failed reload
//! leaves the registry empty so stale sessions are never used.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::inference::backend::BackendLoader;
use crate::inference::controller::{SessionController, SessionSetup};
use crate::inference::error::SessionError;
use crate::inference::params::GenerationParameters;
use crate::inference::streaming::EventSink;

pub struct SessionRegistry {
    sessions: Vec<SessionController>,
    sink: Arc<dyn EventSink>,
}

impl SessionRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sessions: Vec::new(),
            sink,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Replaces every session with a freshly loaded one.
    ///
    /// Slots are numbered by position in `setups`.
    pub fn reload<L: BackendLoader>(
        &mut self,
        loader: Arc<L>,
        setups: Vec<SessionSetup>,
    ) -> Result<(), SessionError> {
        self.shutdown();

        let count = setups.len();
        for (slot, mut setup) in setups.into_iter().enumerate() {
            setup.slot = slot;
            info!(slot, model = %setup.model_path.display(), "Loading session");
            match SessionController::spawn(setup, loader.clone(), self.sink.clone()) {
                Ok(controller) => self.sessions.push(controller),
                Err(e) => {
                    warn!(slot, "Reload aborted: {}", e);
                    self.sink.on_error(slot, &e.to_string());
                    self.shutdown();
                    return Err(e);
                }
            }
        }

        info!(sessions = count, "Sessions reloaded");
        Ok(())
    }

    pub fn get(&self, slot: usize) -> Result<&SessionController, SessionError> {
        self.sessions
            .get(slot)
            .ok_or(SessionError::UnknownSlot(slot))
    }

    pub fn get_mut(&mut self, slot: usize) -> Result<&mut SessionController, SessionError> {
        self.sessions
            .get_mut(slot)
            .ok_or(SessionError::UnknownSlot(slot))
    }

    pub fn start(&self, slot: usize, prompt: &str) -> Result<(), SessionError> {
        self.get(slot)?.start(prompt)
    }

    pub fn submit_input(&self, slot: usize, text: &str) -> Result<(), SessionError> {
        self.get(slot)?.submit_input(text);
        Ok(())
    }

    pub fn pause(&self, slot: usize) -> Result<(), SessionError> {
        self.get(slot)?.pause()
    }

    pub fn resume(&self, slot: usize) -> Result<(), SessionError> {
        self.get(slot)?.resume()
    }

    pub fn stop(&self, slot: usize) -> Result<(), SessionError> {
        self.get(slot)?.stop()
    }

    pub fn regenerate(&self, slot: usize) -> Result<(), SessionError> {
        self.get(slot)?.regenerate()
    }

    pub fn set_parameters(
        &mut self,
        slot: usize,
        params: GenerationParameters,
        reseed_if_changed: bool,
    ) -> Result<Option<u32>, SessionError> {
        Ok(self.get_mut(slot)?.set_parameters(params, reseed_if_changed))
    }

    /// Pauses every busy session; idle ones are skipped silently
    pub fn pause_all(&self) {
        for session in &self.sessions {
            let _ = session.pause();
        }
    }

    /// Stops every busy session; idle ones are skipped silently
    pub fn stop_all(&self) {
        for session in &self.sessions {
            let _ = session.stop();
        }
    }

    pub fn is_any_busy(&self) -> bool {
        self.sessions.iter().any(SessionController::is_busy)
    }

    /// Waits for every session to become idle within `timeout`
    pub fn wait_all_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        self.sessions.iter().all(|session| {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            session.wait_idle(left)
        })
    }

    /// Stops and joins all sessions
    pub fn shutdown(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        self.stop_all();
        for mut session in self.sessions.drain(..) {
            session.shutdown();
        }
        info!("All sessions shut down");
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
