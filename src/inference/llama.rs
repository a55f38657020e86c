//! llama.cpp backend
//!
//! Implements the backend trait family over `llama-cpp-2`.
//!
//! # Ownership
//!
//! `LlamaContext` borrows the `LlamaModel` it was created from, but a
//! session needs to own both. The model is therefore kept behind an `Arc`
//! that every dependent resource (context, projector) also holds, and the
//! context's borrow is widened to `'static`. Each dependent declares the
//! borrowing field before its `Arc`, so the borrow is always dropped first.
//!
//! `LlamaBackend` may only exist once per process. Sessions share it through
//! a weak registry: the first session to need it initializes it and the
//! runtime shuts down when the last session releases its reference.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Arc, Mutex, Once, Weak};

use llama_cpp_2::context::params::{KvCacheType, LlamaContextParams};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::mtmd::{
    mtmd_default_marker, MtmdBitmap, MtmdContext, MtmdContextParams, MtmdInputChunkType,
    MtmdInputText,
};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};
use once_cell::sync::Lazy;

use crate::inference::backend::{
    Backend, BackendError, ContextParams, InferenceContext, ProjectorParams, SamplerChain, TokenId,
    TokenSampler, VisionProjector, PIECE_BUFFER_LEN,
};
use crate::inference::model::read_gguf_header;
use crate::types::KvCacheKind;

static RUNTIME: Lazy<Mutex<Weak<LlamaBackend>>> = Lazy::new(|| Mutex::new(Weak::new()));
static ENGINE_LOGS: Once = Once::new();

/// Backend that loads GGUF models through llama.cpp
#[derive(Debug, Clone, Copy, Default)]
pub struct LlamaCppBackend;

/// Loaded model weights and vocabulary
pub struct LlamaWeights(Arc<LlamaModel>);

/// Inference context bound to its model
pub struct LlamaSession {
    ctx: LlamaContext<'static>,
    model: Arc<LlamaModel>,
    _runtime: Arc<LlamaBackend>,
    n_batch: usize,
}

/// The fixed sampler chain
pub struct LlamaChain(LlamaSampler);

/// Multimodal projector bound to its model
pub struct LlamaProjector {
    ctx: MtmdContext,
    _model: Arc<LlamaModel>,
    /// Media marker the multimodal tokenizer looks for
    marker: String,
    n_batch: i32,
    image_max_tokens: usize,
}

/// Engine-side counts are `i32`; anything larger is rejected, not wrapped
fn to_i32(field: &str, value: u32) -> Result<i32, String> {
    i32::try_from(value).map_err(|_| format!("{field} = {value} does not fit the engine"))
}

fn path_str(path: &Path) -> Result<&str, String> {
    path.to_str()
        .ok_or_else(|| format!("path is not valid UTF-8: {}", path.display()))
}

impl Backend for LlamaCppBackend {
    type Runtime = Arc<LlamaBackend>;
    type Model = LlamaWeights;
    type Context = LlamaSession;
    type Sampler = LlamaChain;
    type Projector = LlamaProjector;

    fn init_runtime(&self) -> Result<Arc<LlamaBackend>, BackendError> {
        let mut slot = RUNTIME
            .lock()
            .map_err(|_| BackendError::Runtime("runtime registry poisoned".to_string()))?;
        if let Some(runtime) = slot.upgrade() {
            return Ok(runtime);
        }

        ENGINE_LOGS.call_once(|| send_logs_to_tracing(LogOptions::default()));
        let runtime = Arc::new(LlamaBackend::init().map_err(|e| BackendError::Runtime(e.to_string()))?);
        *slot = Arc::downgrade(&runtime);
        tracing::info!("llama.cpp runtime initialized");
        Ok(runtime)
    }

    fn load_model(&self, runtime: &Arc<LlamaBackend>, path: &Path) -> Result<LlamaWeights, BackendError> {
        let header = read_gguf_header(path).map_err(|e| BackendError::Model(e.to_string()))?;
        tracing::debug!(
            "GGUF v{} with {} tensors at {}",
            header.version,
            header.tensor_count,
            path.display()
        );

        // Weights are memory-mapped by default
        let params = LlamaModelParams::default();
        let model = LlamaModel::load_from_file(runtime, path, &params)
            .map_err(|e| BackendError::Model(e.to_string()))?;
        Ok(LlamaWeights(Arc::new(model)))
    }

    fn new_context(
        &self,
        runtime: &Arc<LlamaBackend>,
        model: &LlamaWeights,
        params: &ContextParams,
    ) -> Result<LlamaSession, BackendError> {
        let n_ctx = NonZeroU32::new(params.n_ctx)
            .ok_or_else(|| BackendError::Context("n_ctx must be greater than zero".to_string()))?;
        let n_threads = to_i32("n_threads", params.n_threads).map_err(BackendError::Context)?;
        let n_threads_batch =
            to_i32("n_threads_batch", params.n_threads_batch).map_err(BackendError::Context)?;

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_ubatch(params.n_ubatch)
            .with_n_threads(n_threads)
            .with_n_threads_batch(n_threads_batch);
        if params.kv_cache == KvCacheKind::Q8_0 {
            ctx_params = ctx_params
                .with_type_k(KvCacheType::Q8_0)
                .with_type_v(KvCacheType::Q8_0);
        }

        let owner = Arc::clone(&model.0);
        // SAFETY: `LlamaSession` stores `owner` alongside the context and
        // declares `ctx` first, so the model outlives every use of this borrow.
        let weights: &'static LlamaModel = unsafe { &*Arc::as_ptr(&owner) };
        let ctx = weights
            .new_context(runtime, ctx_params)
            .map_err(|e| BackendError::Context(e.to_string()))?;

        Ok(LlamaSession {
            ctx,
            model: owner,
            _runtime: Arc::clone(runtime),
            n_batch: params.n_batch.max(1) as usize,
        })
    }

    fn new_sampler(&self, chain: &SamplerChain) -> LlamaChain {
        LlamaChain(LlamaSampler::chain_simple([
            LlamaSampler::penalties(
                chain.penalty_last_n,
                chain.penalty_repeat,
                chain.penalty_freq,
                chain.penalty_present,
            ),
            LlamaSampler::top_k(chain.top_k),
            LlamaSampler::top_p(chain.top_p, chain.min_keep),
            LlamaSampler::temp(chain.temperature),
            LlamaSampler::dist(chain.seed),
        ]))
    }

    fn load_projector(
        &self,
        model: &LlamaWeights,
        path: &Path,
        params: &ProjectorParams,
    ) -> Result<LlamaProjector, BackendError> {
        read_gguf_header(path).map_err(|e| BackendError::Projector(e.to_string()))?;
        let path = path_str(path).map_err(BackendError::Projector)?;
        let n_threads = to_i32("n_threads", params.n_threads).map_err(BackendError::Projector)?;
        let n_batch = to_i32("n_batch", params.n_batch).map_err(BackendError::Projector)?;

        let mut mtmd_params = MtmdContextParams::default();
        mtmd_params.use_gpu = params.use_gpu;
        mtmd_params.n_threads = n_threads;

        let ctx = MtmdContext::init_from_file(path, &model.0, &mtmd_params)
            .map_err(|e| BackendError::Projector(e.to_string()))?;

        Ok(LlamaProjector {
            ctx,
            _model: Arc::clone(&model.0),
            marker: mtmd_default_marker().to_string(),
            n_batch,
            image_max_tokens: params.image_max_tokens as usize,
        })
    }
}

impl InferenceContext for LlamaSession {
    fn clear_memory(&mut self) {
        self.ctx.clear_kv_cache();
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| BackendError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn decode(&mut self, tokens: &[TokenId], start: i32) -> Result<(), BackendError> {
        let last = tokens.len().saturating_sub(1);
        let mut batch = LlamaBatch::new(self.n_batch, 1);

        for (chunk_index, chunk) in tokens.chunks(self.n_batch).enumerate() {
            batch.clear();
            for (offset, token) in chunk.iter().enumerate() {
                let index = chunk_index * self.n_batch + offset;
                batch
                    .add(LlamaToken(*token), start + index as i32, &[0], index == last)
                    .map_err(|e| BackendError::Decode(e.to_string()))?;
            }
            self.ctx
                .decode(&mut batch)
                .map_err(|e| BackendError::Decode(e.to_string()))?;
        }
        Ok(())
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn token_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        let mut bytes = self
            .model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| BackendError::Tokenization(e.to_string()))?;
        bytes.truncate(PIECE_BUFFER_LEN);
        Ok(bytes)
    }
}

impl TokenSampler<LlamaSession> for LlamaChain {
    fn sample(&mut self, ctx: &LlamaSession) -> TokenId {
        // -1 selects the logits of the last decoded position
        self.0.sample(&ctx.ctx, -1).0
    }

    fn accept(&mut self, token: TokenId) {
        self.0.accept(LlamaToken(token));
    }
}

impl VisionProjector<LlamaSession> for LlamaProjector {
    type Bitmap = MtmdBitmap;

    fn marker(&self) -> &str {
        &self.marker
    }

    fn load_bitmap(&self, path: &Path) -> Result<MtmdBitmap, BackendError> {
        let path = path_str(path).map_err(BackendError::Image)?;
        MtmdBitmap::from_file(&self.ctx, path).map_err(|e| BackendError::Image(e.to_string()))
    }

    fn eval_prompt(&self, ctx: &mut LlamaSession, text: &str, bitmap: &MtmdBitmap) -> Result<i32, BackendError> {
        let input = MtmdInputText {
            text: text.to_string(),
            add_special: true,
            parse_special: true,
        };
        let chunks = self
            .ctx
            .tokenize(input, &[bitmap])
            .map_err(|e| BackendError::Tokenization(e.to_string()))?;

        for i in 0..chunks.len() {
            if let Some(chunk) = chunks.get(i) {
                if chunk.chunk_type() == MtmdInputChunkType::Image && chunk.n_tokens() > self.image_max_tokens {
                    tracing::warn!(
                        "Image expands to {} tokens, above the configured budget of {}",
                        chunk.n_tokens(),
                        self.image_max_tokens
                    );
                }
            }
        }

        chunks
            .eval_chunks(&self.ctx, &mut ctx.ctx, 0, 0, self.n_batch, true)
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}
