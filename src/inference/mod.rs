//! LLM inference engine
//!
//! Per-character generation sessions running on dedicated worker threads,
//! driven from the UI thread through [`SessionController`] and
//! [`SessionRegistry`].

pub mod backend;
pub mod context;
pub mod controller;
pub mod error;
#[cfg(feature = "llama")]
pub mod llama;
#[cfg(test)]
pub(crate) mod mock;
pub mod model;
pub mod params;
pub mod registry;
pub mod ring;
pub mod sampling;
pub mod session;
pub mod snapshot;
pub mod streaming;

// Re-export main types for convenience
pub use backend::{Backend, BackendError, BackendLoader, TokenId};
pub use controller::{SessionController, SessionSetup};
pub use error::SessionError;
#[cfg(feature = "llama")]
pub use llama::{LlamaCppBackend, LlamaCppLoader};
pub use model::{validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use params::{GenerationParameters, MirostatMode, AUTO, AUTO_SEED, UNBOUNDED};
pub use registry::SessionRegistry;
pub use session::{RunOutcome, RunReport};
pub use streaming::{ChannelSink, EventSink, SessionEvent, StatusEvent};
