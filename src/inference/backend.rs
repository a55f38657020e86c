//! Engine capability interface
//!
//! The session and generation loop never talk to an inference engine
//! directly. They go through this trait family, which the llama.cpp binding
//! implements for production and a scripted backend implements for tests.

use std::path::Path;

use thiserror::Error;

use crate::types::{EngineConfig, KvCacheKind};

/// Vocabulary entry id
pub type TokenId = i32;

/// Upper bound on the rendered size of a single token
pub const PIECE_BUFFER_LEN: usize = 256;

/// Failures reported by a backend. Callers decide which stage they map to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize runtime: {0}")]
    Runtime(String),

    #[error("Failed to load model: {0}")]
    Model(String),

    #[error("Failed to create context: {0}")]
    Context(String),

    #[error("Failed to load projector: {0}")]
    Projector(String),

    #[error("Failed to load image: {0}")]
    Image(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Parameters for building an inference context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_threads: u32,
    pub n_threads_batch: u32,
    pub kv_cache: KvCacheKind,
}

impl From<&EngineConfig> for ContextParams {
    fn from(config: &EngineConfig) -> Self {
        Self {
            n_ctx: config.n_ctx,
            n_batch: config.n_batch,
            n_ubatch: config.n_ubatch(),
            n_threads: config.n_threads,
            n_threads_batch: config.n_threads_batch,
            kv_cache: config.kv_cache(),
        }
    }
}

/// Parameters for building a multimodal projector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectorParams {
    pub use_gpu: bool,
    pub n_threads: u32,
    /// Batch size used when evaluating image chunks
    pub n_batch: u32,
    pub image_min_tokens: u32,
    pub image_max_tokens: u32,
}

impl From<&EngineConfig> for ProjectorParams {
    fn from(config: &EngineConfig) -> Self {
        let (image_min_tokens, image_max_tokens) = config.image_token_budget();
        Self {
            use_gpu: false,
            n_threads: config.n_threads,
            n_batch: config.n_batch,
            image_min_tokens,
            image_max_tokens,
        }
    }
}

/// The fixed sampler pipeline: penalties, top-k, top-p, temperature, then a
/// seeded random pick.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerChain {
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_keep: usize,
    pub temperature: f32,
    pub seed: u32,
}

impl Default for SamplerChain {
    fn default() -> Self {
        Self {
            penalty_last_n: 64,
            penalty_repeat: 1.45,
            penalty_freq: 0.4,
            penalty_present: 0.4,
            top_k: 40,
            top_p: 0.95,
            min_keep: 1,
            temperature: 0.7,
            seed: time_seed(),
        }
    }
}

/// Seed derived from wall-clock seconds
fn time_seed() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// An inference context: sequence memory plus the vocabulary it decodes with.
pub trait InferenceContext {
    /// Drops every cached token for every sequence.
    fn clear_memory(&mut self);

    /// Tokenizes text with a leading BOS and special-token parsing.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError>;

    /// Decodes `tokens` at positions `start..start + tokens.len()`, keeping
    /// logits for the last one.
    fn decode(&mut self, tokens: &[TokenId], start: i32) -> Result<(), BackendError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Renders a token, special tokens included, to at most
    /// [`PIECE_BUFFER_LEN`] bytes. Pieces may end mid UTF-8 sequence.
    fn token_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;
}

/// Stateful token selection over a context's current logits
pub trait TokenSampler<C> {
    fn sample(&mut self, ctx: &C) -> TokenId;

    /// Records a chosen token in the sampler's running state (penalties).
    fn accept(&mut self, token: TokenId);
}

/// Turns images into context input
pub trait VisionProjector<C> {
    type Bitmap;

    /// Marker that stands in for the image inside a prompt
    fn marker(&self) -> &str;

    fn load_bitmap(&self, path: &Path) -> Result<Self::Bitmap, BackendError>;

    /// Tokenizes `text` (which contains one marker) with `bitmap` into chunks
    /// and evaluates them into `ctx` from position 0. Returns the decode
    /// position reached.
    fn eval_prompt(&self, ctx: &mut C, text: &str, bitmap: &Self::Bitmap) -> Result<i32, BackendError>;
}

/// Factory for every engine resource a session owns
pub trait Backend {
    /// Process runtime; released when dropped
    type Runtime;
    type Model;
    type Context: InferenceContext;
    type Sampler: TokenSampler<Self::Context>;
    type Projector: VisionProjector<Self::Context>;

    fn init_runtime(&self) -> Result<Self::Runtime, BackendError>;

    /// Loads weights with memory-mapped I/O.
    fn load_model(&self, runtime: &Self::Runtime, path: &Path) -> Result<Self::Model, BackendError>;

    fn new_context(
        &self,
        runtime: &Self::Runtime,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, BackendError>;

    fn new_sampler(&self, chain: &SamplerChain) -> Self::Sampler;

    fn load_projector(
        &self,
        model: &Self::Model,
        path: &Path,
        params: &ProjectorParams,
    ) -> Result<Self::Projector, BackendError>;
}
