//! Generation loop
//!
//! Drives one inference call: `Priming` encodes the prompt (and image, when
//! one is attached and usable), then `Streaming` samples, emits and decodes
//! one token per step until a terminal state is reached.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::inference::backend::{Backend, BackendError, InferenceContext, TokenSampler, VisionProjector};
use crate::inference::streaming::{TokenSink, Utf8Assembler};
use crate::truncate_str;

/// Hard ceiling on sampling steps per call
pub const MAX_GENERATION_STEPS: usize = 4096;

/// Terminal states of a single generation call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Done,
    Cancelled,
    Failed,
}

/// Why a generation call stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The model produced an end-of-generation token
    EndOfGeneration,
    /// [`MAX_GENERATION_STEPS`] tokens were sampled
    StepLimit,
    /// The cancel flag was observed
    Cancelled,
    /// The sink's consumer disconnected
    ConsumerGone,
    /// The text prompt could not be tokenized or decoded
    PrimeFailed(String),
    /// Decoding a sampled token failed
    DecodeFailed(String),
}

impl Termination {
    /// Terminal state this reason corresponds to
    pub fn state(&self) -> GenerationState {
        match self {
            Termination::EndOfGeneration | Termination::StepLimit => GenerationState::Done,
            Termination::Cancelled | Termination::ConsumerGone => GenerationState::Cancelled,
            Termination::PrimeFailed(_) | Termination::DecodeFailed(_) => GenerationState::Failed,
        }
    }
}

/// What happened to the image attached to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageUse {
    /// The request carried no image
    NotRequested,
    /// An image was attached but no projector is loaded; text only
    NoProjector,
    /// The image was encoded into the context
    Attached,
    /// The image could not be used; generation fell back to text only
    Degraded(String),
}

/// Outcome of one generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    pub termination: Termination,
    pub image: ImageUse,
    /// Decode position reached after priming
    pub prompt_tokens: i32,
    /// Tokens sampled, including a final end-of-generation token
    pub steps: usize,
    /// Non-empty fragments delivered to the sink
    pub fragments: usize,
}

impl GenerationReport {
    pub fn state(&self) -> GenerationState {
        self.termination.state()
    }
}

/// A single inference request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
        }
    }

    /// Attaches an image. An empty path means no image.
    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.image = if path.as_os_str().is_empty() { None } else { Some(path) };
        self
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.image
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// Cloneable handle to a session's cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the running generation to stop at its next step boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Borrowed session resources for one call
pub(crate) struct Generation<'a, B: Backend> {
    pub ctx: &'a mut B::Context,
    pub sampler: &'a mut B::Sampler,
    pub projector: Option<&'a B::Projector>,
    pub cancel: &'a CancelHandle,
}

impl<'a, B: Backend> Generation<'a, B> {
    pub fn run<S: TokenSink + ?Sized>(self, request: &GenerationRequest, sink: &mut S) -> GenerationReport {
        let Generation {
            ctx,
            sampler,
            projector,
            cancel,
        } = self;

        cancel.reset();
        ctx.clear_memory();
        tracing::debug!(
            "Priming: {:?} ({} bytes), image={:?}",
            truncate_str(&request.prompt, 64),
            request.prompt.len(),
            request.image_path()
        );

        let (primed, image) = prime::<B>(ctx, projector, request);
        let prompt_tokens = match primed {
            Ok(n_past) => n_past,
            Err(e) => {
                tracing::warn!("Prompt evaluation failed: {}", e);
                return GenerationReport {
                    termination: Termination::PrimeFailed(e.to_string()),
                    image,
                    prompt_tokens: 0,
                    steps: 0,
                    fragments: 0,
                };
            }
        };

        let mut stream = Stream {
            n_past: prompt_tokens,
            steps: 0,
            fragments: 0,
            utf8: Utf8Assembler::new(),
        };
        let termination = stream.run::<B, S>(ctx, sampler, cancel, sink);

        // Only whole characters are ever emitted
        if stream.utf8.has_pending() {
            let tail = stream.utf8.finish();
            tracing::debug!("Dropped incomplete UTF-8 tail {:?}", tail);
        }

        tracing::debug!(
            "Generation finished: {:?} after {} steps, {} fragments",
            termination,
            stream.steps,
            stream.fragments
        );

        GenerationReport {
            termination,
            image,
            prompt_tokens,
            steps: stream.steps,
            fragments: stream.fragments,
        }
    }
}

/// Encodes the request into a freshly cleared context.
fn prime<B: Backend>(
    ctx: &mut B::Context,
    projector: Option<&B::Projector>,
    request: &GenerationRequest,
) -> (Result<i32, BackendError>, ImageUse) {
    let image = match (request.image_path(), projector) {
        (None, _) => ImageUse::NotRequested,
        (Some(path), None) => {
            tracing::warn!("Image {} ignored: no projector loaded", path.display());
            ImageUse::NoProjector
        }
        (Some(path), Some(projector)) => {
            let started = Instant::now();
            match prime_with_image::<B>(ctx, projector, path, &request.prompt) {
                Ok(n_past) => {
                    tracing::debug!("Vision total: {:.2?}", started.elapsed());
                    return (Ok(n_past), ImageUse::Attached);
                }
                Err(e) => {
                    tracing::warn!("Image {} skipped, continuing text-only: {}", path.display(), e);
                    // Chunk evaluation may have left partial state behind
                    ctx.clear_memory();
                    ImageUse::Degraded(e.to_string())
                }
            }
        }
    };

    (prime_text(ctx, &request.prompt), image)
}

fn prime_with_image<B: Backend>(
    ctx: &mut B::Context,
    projector: &B::Projector,
    path: &Path,
    prompt: &str,
) -> Result<i32, BackendError> {
    let bitmap = projector.load_bitmap(path)?;
    let text = format!("{}\n{}", projector.marker(), prompt);
    projector.eval_prompt(ctx, &text, &bitmap)
}

fn prime_text<C: InferenceContext>(ctx: &mut C, prompt: &str) -> Result<i32, BackendError> {
    let tokens = ctx.tokenize(prompt)?;
    if tokens.is_empty() {
        return Err(BackendError::Tokenization("prompt produced no tokens".to_string()));
    }
    ctx.decode(&tokens, 0)?;
    Ok(tokens.len() as i32)
}

/// Per-call streaming counters
struct Stream {
    n_past: i32,
    steps: usize,
    fragments: usize,
    utf8: Utf8Assembler,
}

impl Stream {
    fn run<B: Backend, S: TokenSink + ?Sized>(
        &mut self,
        ctx: &mut B::Context,
        sampler: &mut B::Sampler,
        cancel: &CancelHandle,
        sink: &mut S,
    ) -> Termination {
        for _ in 0..MAX_GENERATION_STEPS {
            if cancel.is_cancelled() {
                tracing::debug!("Generation cancelled");
                return Termination::Cancelled;
            }

            let token = sampler.sample(ctx);
            self.steps += 1;
            if ctx.is_end_of_generation(token) {
                return Termination::EndOfGeneration;
            }

            match ctx.token_piece(token) {
                Ok(bytes) => {
                    let text = self.utf8.push(&bytes);
                    if !text.is_empty() {
                        if sink.emit(&text).is_err() {
                            tracing::debug!("Receiver dropped, stopping generation");
                            return Termination::ConsumerGone;
                        }
                        self.fragments += 1;
                    }
                }
                Err(e) => tracing::debug!("Token {} has no text rendering: {}", token, e),
            }

            sampler.accept(token);
            if let Err(e) = ctx.decode(&[token], self.n_past) {
                tracing::warn!("Decode failed at position {}: {}", self.n_past, e);
                return Termination::DecodeFailed(e.to_string());
            }
            self.n_past += 1;
        }

        Termination::StepLimit
    }
}
