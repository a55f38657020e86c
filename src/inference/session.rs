//! Session lifecycle
//!
//! A [`Session`] owns every engine resource for one loaded model: the
//! runtime reference, model weights, inference context, sampler chain and
//! optional multimodal projector. Operations mirror the host boundary:
//! configure, load a model, load a projector, infer, cancel, free.

use std::path::Path;

use thiserror::Error;

use crate::inference::backend::{Backend, BackendError, ContextParams, ProjectorParams, SamplerChain};
use crate::inference::generation::{CancelHandle, Generation, GenerationReport, GenerationRequest};
use crate::inference::streaming::TokenSink;
use crate::system::crash;
use crate::types::{ConfigError, EngineConfig, StatusCode};

/// Errors from loading a model or projector
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Engine runtime unavailable: {0}")]
    RuntimeInit(String),

    #[error("Invalid model file {path}: {reason}")]
    ModelFileInvalid { path: String, reason: String },

    #[error("Failed to create inference context: {0}")]
    ContextInitFailed(String),

    #[error("No model loaded")]
    NoModel,

    #[error("Invalid projector file {path}: {reason}")]
    ProjectorInvalid { path: String, reason: String },
}

/// Errors that prevent a generation call from starting
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GenError {
    #[error("No session: load a model first")]
    NoSession,
}

impl StatusCode for ConfigError {
    fn status_code(&self) -> i32 {
        -1
    }
}

impl StatusCode for LoadError {
    fn status_code(&self) -> i32 {
        match self {
            LoadError::RuntimeInit(_) | LoadError::ModelFileInvalid { .. } => -1,
            LoadError::ContextInitFailed(_) => -2,
            LoadError::ProjectorInvalid { .. } => -1,
            LoadError::NoModel => -2,
        }
    }
}

impl StatusCode for GenError {
    fn status_code(&self) -> i32 {
        -1
    }
}

/// One engine session.
///
/// Fields are declared dependents-first so that dropping the session
/// releases the projector, sampler and context before the model, and the
/// model before the runtime.
pub struct Session<B: Backend> {
    projector: Option<B::Projector>,
    sampler: Option<B::Sampler>,
    context: Option<B::Context>,
    model: Option<B::Model>,
    runtime: Option<B::Runtime>,
    backend: B,
    config: EngineConfig,
    cancel: CancelHandle,
}

impl<B: Backend> Session<B> {
    /// Creates an empty session with default configuration
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: B, config: EngineConfig) -> Self {
        Self {
            projector: None,
            sampler: None,
            context: None,
            model: None,
            runtime: None,
            backend,
            config,
            cancel: CancelHandle::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Applies a JSON config update; see [`EngineConfig::configure`].
    ///
    /// Takes effect on the next model or projector load.
    pub fn configure(&mut self, json: &str) -> Result<(), ConfigError> {
        self.config.configure(json).map_err(|e| {
            tracing::error!("Config parse error: {}", e);
            e
        })
    }

    /// Returns true if a model is currently loaded
    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Returns true if generation can run
    pub fn is_ready(&self) -> bool {
        self.context.is_some() && self.sampler.is_some()
    }

    pub fn has_projector(&self) -> bool {
        self.projector.is_some()
    }

    /// Handle that can cancel this session's generation from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Requests the running generation to stop. Fire and forget.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Loads a model and builds its context and sampler chain.
    ///
    /// Any resources from a previous load are released first, so a failed
    /// load leaves the session without a model.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        crash::install();

        if self.runtime.is_none() {
            let runtime = self
                .backend
                .init_runtime()
                .map_err(|e| LoadError::RuntimeInit(e.to_string()))?;
            self.runtime = Some(runtime);
        }
        if self.model.is_some() {
            tracing::warn!("Replacing loaded model with {}", path.display());
            self.release_model();
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(LoadError::RuntimeInit("runtime not initialized".to_string()));
        };

        let model = self.backend.load_model(runtime, path).map_err(|e| {
            tracing::error!("Model load failed for {}: {}", path.display(), e);
            LoadError::ModelFileInvalid {
                path: path.display().to_string(),
                reason: reason(e),
            }
        })?;

        let params = ContextParams::from(&self.config);
        let context = self
            .backend
            .new_context(runtime, &model, &params)
            .map_err(|e| {
                tracing::error!("Context init failed: {}", e);
                LoadError::ContextInitFailed(reason(e))
            })?;

        let sampler = self.backend.new_sampler(&SamplerChain::default());

        self.model = Some(model);
        self.context = Some(context);
        self.sampler = Some(sampler);

        tracing::info!(
            "Engine loaded: {} (ctx={}, batch={}, ubatch={}, threads={}/{}, kv={:?})",
            path.display(),
            params.n_ctx,
            params.n_batch,
            params.n_ubatch,
            params.n_threads,
            params.n_threads_batch,
            params.kv_cache
        );
        Ok(())
    }

    /// Loads a multimodal projector bound to the current model, replacing
    /// any projector already loaded.
    pub fn load_projector(&mut self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        let Some(model) = self.model.as_ref() else {
            return Err(LoadError::NoModel);
        };

        self.projector = None;

        let params = ProjectorParams::from(&self.config);
        let projector = self
            .backend
            .load_projector(model, path, &params)
            .map_err(|e| {
                tracing::error!("Projector load failed for {}: {}", path.display(), e);
                LoadError::ProjectorInvalid {
                    path: path.display().to_string(),
                    reason: reason(e),
                }
            })?;

        self.projector = Some(projector);
        tracing::info!(
            "Projector loaded: {} (image tokens {}..={})",
            path.display(),
            params.image_min_tokens,
            params.image_max_tokens
        );
        Ok(())
    }

    /// Runs one generation call, streaming fragments into `sink`.
    ///
    /// Blocks until the call ends. Cancellation, decode failures and image
    /// degradation are reported in the returned [`GenerationReport`], not as
    /// errors.
    pub fn infer<S: TokenSink + ?Sized>(
        &mut self,
        request: &GenerationRequest,
        sink: &mut S,
    ) -> Result<GenerationReport, GenError> {
        let (Some(ctx), Some(sampler)) = (self.context.as_mut(), self.sampler.as_mut()) else {
            return Err(GenError::NoSession);
        };

        let report = Generation::<B> {
            ctx,
            sampler,
            projector: self.projector.as_ref(),
            cancel: &self.cancel,
        }
        .run(request, sink);

        tracing::info!(
            "Inference finished: {:?}, {} fragments, image {:?}",
            report.termination,
            report.fragments,
            report.image
        );
        Ok(report)
    }

    /// Releases every resource and the runtime reference. Idempotent.
    pub fn free_engine(&mut self) {
        self.release_model();
        if self.runtime.take().is_some() {
            tracing::info!("Engine freed");
        }
    }

    fn release_model(&mut self) {
        self.projector = None;
        self.sampler = None;
        self.context = None;
        self.model = None;
    }
}

/// Strips the stage prefix from a backend error, keeping the engine's message
fn reason(error: BackendError) -> String {
    match error {
        BackendError::Runtime(s)
        | BackendError::Model(s)
        | BackendError::Context(s)
        | BackendError::Projector(s)
        | BackendError::Image(s)
        | BackendError::Tokenization(s)
        | BackendError::Decode(s) => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::generation::{GenerationState, ImageUse, Termination, MAX_GENERATION_STEPS};
    use crate::inference::mock::{Event, MockBackend, Script, MARKER};
    use crate::inference::streaming::SinkClosed;
    use crate::types::status_of;

    fn collect(session: &mut Session<MockBackend>, request: &GenerationRequest) -> (Vec<String>, GenerationReport) {
        let mut fragments = Vec::new();
        let report = session
            .infer(request, &mut |s: &str| fragments.push(s.to_string()))
            .unwrap();
        (fragments, report)
    }

    fn loaded(script: Script) -> (Session<MockBackend>, MockBackend) {
        let backend = MockBackend::new(script);
        let mut session = Session::new(backend.clone());
        session.load_model("/models/tiny.gguf").unwrap();
        (session, backend)
    }

    #[test]
    fn test_infer_before_load_is_no_session() {
        let mut session = Session::new(MockBackend::default());
        let mut calls = 0;
        let result = session.infer(&GenerationRequest::new("Hello"), &mut |_: &str| calls += 1);
        assert_eq!(status_of(&result), -1);
        assert_eq!(result.unwrap_err(), GenError::NoSession);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_load_model_builds_context_from_config() {
        let backend = MockBackend::default();
        let mut session = Session::new(backend.clone());
        session.configure(r#"{"n_ctx": 512, "n_batch": 64}"#).unwrap();
        session.load_model("/models/tiny.gguf").unwrap();

        assert!(session.is_model_loaded());
        assert!(session.is_ready());
        let events = backend.events();
        assert_eq!(events[0], Event::RuntimeInit);
        assert!(events.contains(&Event::SamplerCreated));
        let params = events
            .iter()
            .find_map(|e| match e {
                Event::ContextCreated(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(params.n_ctx, 512);
        assert_eq!(params.n_batch, 64);
        assert_eq!(params.n_ubatch, 32);
    }

    #[test]
    fn test_load_model_failures_map_to_status_codes() {
        let mut session = Session::new(MockBackend::new(Script {
            fail_model: true,
            ..Script::default()
        }));
        let result = session.load_model("/missing.gguf");
        assert!(matches!(result, Err(LoadError::ModelFileInvalid { .. })));
        assert_eq!(status_of(&result), -1);
        assert!(!session.is_model_loaded());

        let mut session = Session::new(MockBackend::new(Script {
            fail_context: true,
            ..Script::default()
        }));
        let result = session.load_model("/models/tiny.gguf");
        assert!(matches!(result, Err(LoadError::ContextInitFailed(_))));
        assert_eq!(status_of(&result), -2);
        assert!(!session.is_ready());

        let mut session = Session::new(MockBackend::new(Script {
            fail_runtime: true,
            ..Script::default()
        }));
        let result = session.load_model("/models/tiny.gguf");
        assert!(matches!(result, Err(LoadError::RuntimeInit(_))));
        assert_eq!(status_of(&result), -1);
    }

    #[test]
    fn test_projector_requires_model() {
        let mut session = Session::new(MockBackend::default());
        let result = session.load_projector("/models/mmproj.gguf");
        assert_eq!(result, Err(LoadError::NoModel));
        assert_eq!(status_of(&result), -2);
    }

    #[test]
    fn test_projector_failure_status() {
        let (mut session, _) = loaded(Script {
            fail_projector: true,
            ..Script::default()
        });
        let result = session.load_projector("/models/mmproj.gguf");
        assert!(matches!(result, Err(LoadError::ProjectorInvalid { .. })));
        assert_eq!(status_of(&result), -1);
        assert!(!session.has_projector());
    }

    #[test]
    fn test_projector_reload_releases_previous() {
        let (mut session, backend) = loaded(Script::default());
        session.load_projector("/models/a.gguf").unwrap();
        backend.clear_events();
        session.load_projector("/models/b.gguf").unwrap();

        let events = backend.events();
        assert_eq!(events[0], Event::ProjectorDropped);
        match &events[1] {
            Event::ProjectorLoaded(path, params) => {
                assert_eq!(path, Path::new("/models/b.gguf"));
                assert!(!params.use_gpu);
                assert_eq!(params.image_min_tokens, 32);
                assert_eq!(params.image_max_tokens, 128);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_streams_until_end_of_generation() {
        let (mut session, _) = loaded(Script {
            eog_at: Some(5),
            ..Script::default()
        });
        let (fragments, report) = collect(&mut session, &GenerationRequest::new("Hello"));

        assert_eq!(fragments, vec!["t1 ", "t2 ", "t3 ", "t4 "]);
        assert_eq!(report.termination, Termination::EndOfGeneration);
        assert_eq!(report.state(), GenerationState::Done);
        assert_eq!(report.steps, 5);
        assert_eq!(report.fragments, 4);
        assert_eq!(report.image, ImageUse::NotRequested);
        // BOS plus one token per prompt byte
        assert_eq!(report.prompt_tokens, 6);
    }

    #[test]
    fn test_decode_positions_follow_prompt() {
        let (mut session, backend) = loaded(Script {
            eog_at: Some(3),
            ..Script::default()
        });
        backend.clear_events();
        collect(&mut session, &GenerationRequest::new("Hi"));

        let decoded: Vec<_> = backend
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Decoded { .. }))
            .collect();
        assert_eq!(
            decoded,
            vec![
                Event::Decoded { start: 0, len: 3 },
                Event::Decoded { start: 3, len: 1 },
                Event::Decoded { start: 4, len: 1 },
            ]
        );
    }

    #[test]
    fn test_step_ceiling() {
        let (mut session, _) = loaded(Script::default());
        let mut count = 0usize;
        let report = session
            .infer(&GenerationRequest::new("Hello"), &mut |_: &str| count += 1)
            .unwrap();
        assert_eq!(report.termination, Termination::StepLimit);
        assert_eq!(report.state(), GenerationState::Done);
        assert_eq!(report.steps, MAX_GENERATION_STEPS);
        assert_eq!(count, MAX_GENERATION_STEPS);
    }

    #[test]
    fn test_cancel_during_streaming_stops_after_current_step() {
        let (mut session, _) = loaded(Script::default());
        let handle = session.cancel_handle();
        let mut fragments = Vec::new();
        let report = session
            .infer(&GenerationRequest::new("Hello"), &mut |s: &str| {
                fragments.push(s.to_string());
                if fragments.len() == 3 {
                    handle.cancel();
                }
            })
            .unwrap();

        assert_eq!(fragments.len(), 3);
        assert_eq!(report.termination, Termination::Cancelled);
        assert_eq!(report.state(), GenerationState::Cancelled);
        assert_eq!(report.steps, 3);
    }

    #[test]
    fn test_cancel_before_infer_has_no_effect() {
        let (mut session, _) = loaded(Script {
            eog_at: Some(4),
            ..Script::default()
        });
        session.cancel();
        let (fragments, report) = collect(&mut session, &GenerationRequest::new("Hello"));
        assert_eq!(fragments.len(), 3);
        assert_eq!(report.termination, Termination::EndOfGeneration);
    }

    #[test]
    fn test_decode_failure_stops_quietly() {
        let (mut session, _) = loaded(Script {
            fail_decode_at: Some(2),
            ..Script::default()
        });
        let (fragments, report) = collect(&mut session, &GenerationRequest::new("Hello"));
        // The fragment for step 2 is emitted before its decode fails
        assert_eq!(fragments, vec!["t1 ", "t2 "]);
        assert!(matches!(report.termination, Termination::DecodeFailed(_)));
        assert_eq!(report.state(), GenerationState::Failed);
    }

    #[test]
    fn test_prompt_decode_failure_emits_nothing() {
        let (mut session, _) = loaded(Script {
            fail_prompt_decode: true,
            ..Script::default()
        });
        let (fragments, report) = collect(&mut session, &GenerationRequest::new("Hello"));
        assert!(fragments.is_empty());
        assert!(matches!(report.termination, Termination::PrimeFailed(_)));
        assert_eq!(report.steps, 0);
    }

    #[test]
    fn test_memory_cleared_each_call() {
        let (mut session, backend) = loaded(Script {
            eog_at: Some(2),
            ..Script::default()
        });
        backend.clear_events();
        let (first, _) = collect(&mut session, &GenerationRequest::new("a"));
        let (second, _) = collect(&mut session, &GenerationRequest::new("a"));
        assert_eq!(first, second);
        let clears = backend
            .events()
            .iter()
            .filter(|e| **e == Event::MemoryCleared)
            .count();
        assert_eq!(clears, 2);
    }

    #[test]
    fn test_image_with_projector_uses_multimodal_path() {
        let (mut session, backend) = loaded(Script {
            eog_at: Some(2),
            ..Script::default()
        });
        session.load_projector("/models/mmproj.gguf").unwrap();
        backend.clear_events();

        let request = GenerationRequest::new("What is this?").with_image("/tmp/cat.png");
        let (fragments, report) = collect(&mut session, &request);

        assert_eq!(report.image, ImageUse::Attached);
        assert_eq!(fragments, vec!["t1 "]);
        let expected = format!("{MARKER}\nWhat is this?");
        assert!(backend.events().contains(&Event::ImageEval(expected.clone())));
        assert!(report.prompt_tokens > expected.len() as i32);
        // The first generated token decodes right after the image chunks
        assert!(backend.events().contains(&Event::Decoded {
            start: report.prompt_tokens,
            len: 1
        }));
    }

    #[test]
    fn test_image_failure_degrades_to_text() {
        let (mut session, backend) = loaded(Script {
            eog_at: Some(2),
            fail_bitmap: true,
            ..Script::default()
        });
        session.load_projector("/models/mmproj.gguf").unwrap();
        backend.clear_events();

        let request = GenerationRequest::new("Hi").with_image("/tmp/broken.png");
        let (fragments, report) = collect(&mut session, &request);

        assert!(matches!(report.image, ImageUse::Degraded(_)));
        assert_eq!(fragments, vec!["t1 "]);
        assert_eq!(report.prompt_tokens, 3);
        assert!(backend.events().contains(&Event::Decoded { start: 0, len: 3 }));
    }

    #[test]
    fn test_image_eval_failure_clears_partial_state() {
        let (mut session, backend) = loaded(Script {
            eog_at: Some(1),
            fail_image_eval: true,
            ..Script::default()
        });
        session.load_projector("/models/mmproj.gguf").unwrap();
        backend.clear_events();

        let request = GenerationRequest::new("Hi").with_image("/tmp/cat.png");
        let (_, report) = collect(&mut session, &request);
        assert!(matches!(report.image, ImageUse::Degraded(_)));
        let clears = backend
            .events()
            .iter()
            .filter(|e| **e == Event::MemoryCleared)
            .count();
        assert_eq!(clears, 2);
    }

    #[test]
    fn test_image_without_projector_is_text_only() {
        let (mut session, backend) = loaded(Script {
            eog_at: Some(1),
            ..Script::default()
        });
        let request = GenerationRequest::new("Hi").with_image("/tmp/cat.png");
        let (_, report) = collect(&mut session, &request);
        assert_eq!(report.image, ImageUse::NoProjector);
        assert!(!backend
            .events()
            .iter()
            .any(|e| matches!(e, Event::ImageEval(_))));
    }

    #[test]
    fn test_split_utf8_is_delivered_whole() {
        let crab = "🦀".as_bytes().to_vec();
        let (mut session, _) = loaded(Script {
            pieces: vec![crab[..2].to_vec(), crab[2..].to_vec(), b"!".to_vec()],
            eog_at: Some(4),
            ..Script::default()
        });
        let (fragments, report) = collect(&mut session, &GenerationRequest::new("x"));
        assert_eq!(fragments, vec!["🦀", "!"]);
        assert_eq!(report.fragments, 2);
    }

    #[test]
    fn test_incomplete_tail_is_dropped_at_end_of_generation() {
        let (mut session, _) = loaded(Script {
            pieces: vec![vec![b'a', 0xE2]],
            eog_at: Some(2),
            ..Script::default()
        });
        let (fragments, report) = collect(&mut session, &GenerationRequest::new("x"));
        assert_eq!(fragments, vec!["a"]);
        assert_eq!(report.fragments, 1);
        assert_eq!(report.termination, Termination::EndOfGeneration);
    }

    #[test]
    fn test_each_step_emits_then_accepts_then_decodes() {
        let (mut session, backend) = loaded(Script {
            eog_at: Some(3),
            ..Script::default()
        });
        backend.clear_events();
        let mut sink = backend.recording_sink();
        let report = session.infer(&GenerationRequest::new("Hi"), &mut sink).unwrap();
        assert_eq!(report.termination, Termination::EndOfGeneration);

        assert_eq!(
            backend.events(),
            vec![
                Event::MemoryCleared,
                Event::Decoded { start: 0, len: 3 },
                Event::Emitted("t1 ".to_string()),
                Event::Accepted(1),
                Event::Decoded { start: 3, len: 1 },
                Event::Emitted("t2 ".to_string()),
                Event::Accepted(2),
                Event::Decoded { start: 4, len: 1 },
            ]
        );
    }

    #[test]
    fn test_closed_sink_stops_generation() {
        struct Closing(usize);
        impl TokenSink for Closing {
            fn emit(&mut self, _fragment: &str) -> Result<(), SinkClosed> {
                self.0 += 1;
                if self.0 > 2 {
                    Err(SinkClosed)
                } else {
                    Ok(())
                }
            }
        }

        let (mut session, _) = loaded(Script::default());
        let mut sink = Closing(0);
        let report = session.infer(&GenerationRequest::new("x"), &mut sink).unwrap();
        assert_eq!(report.termination, Termination::ConsumerGone);
        assert_eq!(report.fragments, 2);
    }

    #[test]
    fn test_reload_releases_previous_model_first() {
        let (mut session, backend) = loaded(Script::default());
        session.load_projector("/models/mmproj.gguf").unwrap();
        backend.clear_events();
        session.load_model("/models/other.gguf").unwrap();

        let events = backend.events();
        assert_eq!(
            &events[..5],
            &[
                Event::ProjectorDropped,
                Event::SamplerDropped,
                Event::ContextDropped,
                Event::ModelDropped,
                Event::ModelLoaded("/models/other.gguf".into()),
            ]
        );
        assert!(!events.contains(&Event::RuntimeInit));
        assert!(!session.has_projector());
    }

    #[test]
    fn test_free_engine_order_and_idempotence() {
        let (mut session, backend) = loaded(Script::default());
        session.load_projector("/models/mmproj.gguf").unwrap();
        backend.clear_events();

        session.free_engine();
        assert_eq!(
            backend.events(),
            vec![
                Event::ProjectorDropped,
                Event::SamplerDropped,
                Event::ContextDropped,
                Event::ModelDropped,
                Event::RuntimeDropped,
            ]
        );
        assert!(!session.is_model_loaded());

        session.free_engine();
        assert_eq!(backend.events().len(), 5);

        let result = session.infer(&GenerationRequest::new("x"), &mut |_: &str| {});
        assert_eq!(result.unwrap_err(), GenError::NoSession);
    }

    #[test]
    fn test_free_engine_on_empty_session() {
        let backend = MockBackend::default();
        let mut session = Session::new(backend.clone());
        session.free_engine();
        session.free_engine();
        assert!(backend.events().is_empty());
    }

    #[test]
    fn test_configure_failure_keeps_config() {
        let mut session = Session::new(MockBackend::default());
        session.configure(r#"{"n_ctx": 512}"#).unwrap();
        let result = session.configure("{oops");
        assert_eq!(status_of(&result), -1);
        assert_eq!(session.config().n_ctx, 512);
    }

    #[test]
    fn test_drop_releases_dependents_first() {
        let (session, backend) = loaded(Script::default());
        backend.clear_events();
        drop(session);
        assert_eq!(
            backend.events(),
            vec![
                Event::SamplerDropped,
                Event::ContextDropped,
                Event::ModelDropped,
                Event::RuntimeDropped,
            ]
        );
    }
}
