//! LLM inference engine
//!
//! Session lifecycle, the generation loop, and the backend binding to
//! llama.cpp.

pub mod backend;
pub mod generation;
#[cfg(feature = "llama")]
pub mod llama;
#[cfg(test)]
pub(crate) mod mock;
pub mod model;
pub mod session;
pub mod streaming;
pub mod worker;

// Re-export main types for convenience
pub use backend::{Backend, BackendError, ContextParams, ProjectorParams, SamplerChain, TokenId};
pub use generation::{
    CancelHandle, GenerationReport, GenerationRequest, GenerationState, ImageUse, Termination,
    MAX_GENERATION_STEPS,
};
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use model::{read_gguf_header, GgufError, GgufHeader, GGUF_MAGIC};
pub use session::{GenError, LoadError, Session};
pub use streaming::{ChannelSink, SinkClosed, StreamToken, TokenSink, Utf8Assembler};
pub use worker::{EngineWorker, WorkerError};
