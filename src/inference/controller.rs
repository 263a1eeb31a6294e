//! Session controller
//!
//! Control-thread handle for one character slot.
//!
//! # Architecture
//!
//! Backend types (llama.cpp contexts in particular) are not `Send`, so every
//! session gets a dedicated worker thread that loads the backend itself and
//! then owns it together with the [`GenerationSession`]. The controller talks
//! to the worker over an mpsc channel for run commands and through the shared
//! [`SessionControl`] block for everything that has to reach a running loop.
//! None of the control methods block except [`SessionController::shutdown`].

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::inference::backend::BackendLoader;
use crate::inference::error::SessionError;
use crate::inference::params::{GenerationParameters, AUTO_SEED};
use crate::inference::session::{GenerationSession, ParamUpdate, SessionControl};
use crate::inference::streaming::EventSink;

/// How long a shutdown waits for a running loop to notice the stop
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a worker needs to build its session
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub slot: usize,
    pub model_path: PathBuf,
    pub params: GenerationParameters,
    /// Speaker tags (user first) used for automatic keep-count detection
    pub speaker_tags: Vec<String>,
    pub auto_keep: bool,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Start { prompt: String },
    Shutdown,
}

pub struct SessionController {
    slot: usize,
    control: Arc<SessionControl>,
    /// Control-side copy of the parameters last handed to the worker
    params: GenerationParameters,
    command_tx: Option<Sender<WorkerCommand>>,
    worker_handle: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Spawns the worker, loads the backend on it and waits for the result
    pub fn spawn<L: BackendLoader>(
        setup: SessionSetup,
        loader: Arc<L>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, SessionError> {
        let slot = setup.slot;
        let params = setup.params.clone();
        let control = Arc::new(SessionControl::new());
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (load_tx, load_rx) = mpsc::channel::<Result<(), SessionError>>();

        let worker_control = control.clone();
        let handle = thread::Builder::new()
            .name(format!("session-{}", slot))
            .spawn(move || {
                worker_thread_main(setup, loader, worker_control, sink, command_rx, load_tx);
            })
            .map_err(|e| SessionError::WorkerUnavailable(e.to_string()))?;

        let loaded = load_rx
            .recv()
            .map_err(|e| SessionError::WorkerUnavailable(e.to_string()))
            .and_then(|result| result);

        if let Err(e) = loaded {
            // The worker exits on its own after a failed load
            if handle.join().is_err() {
                warn!(slot, "Session worker panicked during load");
            }
            return Err(e);
        }

        info!(slot, "Session worker started");
        Ok(Self {
            slot,
            control,
            params,
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn params(&self) -> &GenerationParameters {
        &self.params
    }

    pub fn is_busy(&self) -> bool {
        self.control.is_busy()
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Idle → Busy. Rejected while a run is in progress.
    pub fn start(&self, prompt: &str) -> Result<(), SessionError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| SessionError::WorkerUnavailable("worker shut down".to_string()))?;

        if !self.control.try_begin() {
            return Err(SessionError::AlreadyBusy);
        }

        if let Err(e) = command_tx.send(WorkerCommand::Start {
            prompt: prompt.to_string(),
        }) {
            self.control.finish();
            return Err(SessionError::WorkerUnavailable(e.to_string()));
        }
        debug!(slot = self.slot, "Run requested");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.require_busy()?;
        self.control.request_pause();
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        self.require_busy()?;
        self.control.request_resume();
        Ok(())
    }

    /// Signals the loop to stop; poll [`Self::is_busy`] or use
    /// [`Self::wait_idle`] before tearing the session down
    pub fn stop(&self) -> Result<(), SessionError> {
        self.require_busy()?;
        self.control.request_stop();
        Ok(())
    }

    /// Hands text to the loop for its next user turn, replacing any
    /// submission that has not been consumed yet
    pub fn submit_input(&self, text: &str) {
        self.control.submit_input(text.to_string());
    }

    /// Redoes the reply currently being produced or just finished
    pub fn regenerate(&self) -> Result<(), SessionError> {
        self.require_busy()?;
        self.control.request_regenerate();
        Ok(())
    }

    /// Replaces the session parameters.
    ///
    /// With `reseed_if_changed` the sampler is reseeded when the seed differs
    /// from the current one. The automatic seed always counts as changed and
    /// the freshly generated seed is returned.
    pub fn set_parameters(
        &mut self,
        mut params: GenerationParameters,
        reseed_if_changed: bool,
    ) -> Option<u32> {
        params.validate();

        let mut generated = None;
        let reseed = if reseed_if_changed && params.seed == AUTO_SEED {
            let seed = params.resolve_seed();
            generated = Some(seed);
            Some(seed)
        } else if reseed_if_changed && params.seed != self.params.seed {
            Some(params.resolve_seed())
        } else {
            None
        };

        if let Some(seed) = reseed {
            info!(slot = self.slot, seed, "Parameters updated with new seed");
        }
        self.params = params.clone();
        self.control.submit_params(ParamUpdate { params, reseed });
        generated
    }

    /// Blocks until the session is idle or `timeout` elapses
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.control.wait_idle(timeout)
    }

    /// Stops any run, waits for it and joins the worker
    pub fn shutdown(&mut self) {
        if self.control.is_busy() {
            self.control.request_stop();
            if !self.control.wait_idle(SHUTDOWN_TIMEOUT) {
                warn!(slot = self.slot, "Session did not stop in time");
            }
        }
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            if handle.join().is_err() {
                warn!(slot = self.slot, "Session worker panicked");
            }
            info!(slot = self.slot, "Session worker stopped");
        }
    }

    fn require_busy(&self) -> Result<(), SessionError> {
        if self.control.is_busy() {
            Ok(())
        } else {
            Err(SessionError::NotBusy)
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread main loop
///
/// Loads the backend, reports the outcome, then serves run commands until
/// shut down.
fn worker_thread_main<L: BackendLoader>(
    setup: SessionSetup,
    loader: Arc<L>,
    control: Arc<SessionControl>,
    sink: Arc<dyn EventSink>,
    command_rx: Receiver<WorkerCommand>,
    load_tx: Sender<Result<(), SessionError>>,
) {
    let backend = match loader.load(&setup.model_path, &setup.params) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(slot = setup.slot, "Failed to load model: {}", e);
            let _ = load_tx.send(Err(SessionError::ModelLoadFailure(e.to_string())));
            return;
        }
    };
    let _ = load_tx.send(Ok(()));

    let mut session = GenerationSession::new(setup.slot, backend, setup.params, control, sink)
        .with_speaker_tags(setup.speaker_tags, setup.auto_keep);

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Start { prompt }) => {
                // Failures are already reported through the sink
                if let Err(e) = session.run_claimed(&prompt) {
                    debug!(slot = setup.slot, "Run ended with error: {}", e);
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                debug!(slot = setup.slot, "Worker thread shutting down");
                break;
            }
            Err(_) => {
                debug!(slot = setup.slot, "Command channel closed, worker exiting");
                break;
            }
        }
    }
}
