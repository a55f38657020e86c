//! Scripted in-memory backend for tests
//!
//! Produces a deterministic token stream and records every resource event so
//! tests can assert on ordering and lifetimes.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::inference::backend::{
    Backend, BackendError, ContextParams, InferenceContext, ProjectorParams, SamplerChain, TokenId,
    TokenSampler, VisionProjector,
};

pub(crate) const EOG_TOKEN: TokenId = 0;
pub(crate) const MARKER: &str = "<__media__>";
const PROMPT_TOKEN_BASE: TokenId = 10_000;
const IMAGE_TOKENS: i32 = 64;

/// What the scripted engine does. Steps are 1-based sampling steps.
#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    /// Bytes rendered at each step; missing entries render as `t<step> `
    pub pieces: Vec<Vec<u8>>,
    pub eog_at: Option<usize>,
    pub fail_decode_at: Option<usize>,
    pub fail_runtime: bool,
    pub fail_model: bool,
    pub fail_context: bool,
    pub fail_projector: bool,
    pub fail_bitmap: bool,
    pub fail_image_eval: bool,
    pub fail_prompt_decode: bool,
    /// Sleep before every sample, to give other threads time to react
    pub step_delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    RuntimeInit,
    RuntimeDropped,
    ModelLoaded(PathBuf),
    ModelDropped,
    ContextCreated(ContextParams),
    ContextDropped,
    SamplerCreated,
    SamplerDropped,
    ProjectorLoaded(PathBuf, ProjectorParams),
    ProjectorDropped,
    MemoryCleared,
    Decoded { start: i32, len: usize },
    ImageEval(String),
    Accepted(TokenId),
    /// Pushed by test sinks so deliveries interleave with engine events
    Emitted(String),
}

pub(crate) type EventLog = Arc<Mutex<Vec<Event>>>;

fn record(log: &EventLog, event: Event) {
    log.lock().unwrap().push(event);
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockBackend {
    pub script: Script,
    pub events: EventLog,
}

impl MockBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            events: EventLog::default(),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// A sink that records every fragment into the shared event log
    pub fn recording_sink(&self) -> impl FnMut(&str) {
        let log = self.events.clone();
        move |s: &str| record(&log, Event::Emitted(s.to_string()))
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }
}

pub(crate) struct MockRuntime(EventLog);

impl Drop for MockRuntime {
    fn drop(&mut self) {
        record(&self.0, Event::RuntimeDropped);
    }
}

pub(crate) struct MockModel(EventLog);

impl Drop for MockModel {
    fn drop(&mut self) {
        record(&self.0, Event::ModelDropped);
    }
}

pub(crate) struct MockContext {
    script: Script,
    events: EventLog,
    sampled: Cell<usize>,
}

impl Drop for MockContext {
    fn drop(&mut self) {
        record(&self.events, Event::ContextDropped);
    }
}

impl InferenceContext for MockContext {
    fn clear_memory(&mut self) {
        self.sampled.set(0);
        record(&self.events, Event::MemoryCleared);
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        let mut tokens = vec![PROMPT_TOKEN_BASE];
        tokens.extend(text.bytes().map(|b| PROMPT_TOKEN_BASE + b as TokenId));
        Ok(tokens)
    }

    fn decode(&mut self, tokens: &[TokenId], start: i32) -> Result<(), BackendError> {
        if start == 0 && self.script.fail_prompt_decode {
            return Err(BackendError::Decode("scripted prompt failure".into()));
        }
        if let [token] = tokens {
            if self.script.fail_decode_at == Some(*token as usize) {
                return Err(BackendError::Decode(format!("scripted failure at {token}")));
            }
        }
        record(
            &self.events,
            Event::Decoded {
                start,
                len: tokens.len(),
            },
        );
        Ok(())
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }

    fn token_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        let index = (token as usize).saturating_sub(1);
        Ok(self
            .script
            .pieces
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("t{token} ").into_bytes()))
    }
}

pub(crate) struct MockSampler(EventLog);

impl Drop for MockSampler {
    fn drop(&mut self) {
        record(&self.0, Event::SamplerDropped);
    }
}

impl TokenSampler<MockContext> for MockSampler {
    fn sample(&mut self, ctx: &MockContext) -> TokenId {
        if let Some(delay) = ctx.script.step_delay {
            std::thread::sleep(delay);
        }
        let step = ctx.sampled.get() + 1;
        ctx.sampled.set(step);
        if ctx.script.eog_at == Some(step) {
            EOG_TOKEN
        } else {
            step as TokenId
        }
    }

    fn accept(&mut self, token: TokenId) {
        record(&self.0, Event::Accepted(token));
    }
}

pub(crate) struct MockProjector {
    script: Script,
    events: EventLog,
}

impl Drop for MockProjector {
    fn drop(&mut self) {
        record(&self.events, Event::ProjectorDropped);
    }
}

impl VisionProjector<MockContext> for MockProjector {
    type Bitmap = PathBuf;

    fn marker(&self) -> &str {
        MARKER
    }

    fn load_bitmap(&self, path: &Path) -> Result<PathBuf, BackendError> {
        if self.script.fail_bitmap {
            return Err(BackendError::Image(format!("cannot decode {}", path.display())));
        }
        Ok(path.to_path_buf())
    }

    fn eval_prompt(&self, ctx: &mut MockContext, text: &str, _bitmap: &PathBuf) -> Result<i32, BackendError> {
        record(&self.events, Event::ImageEval(text.to_string()));
        if self.script.fail_image_eval {
            return Err(BackendError::Tokenization("scripted chunk failure".into()));
        }
        let n_past = ctx.tokenize(text)?.len() as i32 + IMAGE_TOKENS;
        Ok(n_past)
    }
}

impl Backend for MockBackend {
    type Runtime = MockRuntime;
    type Model = MockModel;
    type Context = MockContext;
    type Sampler = MockSampler;
    type Projector = MockProjector;

    fn init_runtime(&self) -> Result<MockRuntime, BackendError> {
        if self.script.fail_runtime {
            return Err(BackendError::Runtime("scripted runtime failure".into()));
        }
        record(&self.events, Event::RuntimeInit);
        Ok(MockRuntime(self.events.clone()))
    }

    fn load_model(&self, _runtime: &MockRuntime, path: &Path) -> Result<MockModel, BackendError> {
        if self.script.fail_model {
            return Err(BackendError::Model(format!("cannot read {}", path.display())));
        }
        record(&self.events, Event::ModelLoaded(path.to_path_buf()));
        Ok(MockModel(self.events.clone()))
    }

    fn new_context(
        &self,
        _runtime: &MockRuntime,
        _model: &MockModel,
        params: &ContextParams,
    ) -> Result<MockContext, BackendError> {
        if self.script.fail_context {
            return Err(BackendError::Context("scripted context failure".into()));
        }
        record(&self.events, Event::ContextCreated(params.clone()));
        Ok(MockContext {
            script: self.script.clone(),
            events: self.events.clone(),
            sampled: Cell::new(0),
        })
    }

    fn new_sampler(&self, _chain: &SamplerChain) -> MockSampler {
        record(&self.events, Event::SamplerCreated);
        MockSampler(self.events.clone())
    }

    fn load_projector(
        &self,
        _model: &MockModel,
        path: &Path,
        params: &ProjectorParams,
    ) -> Result<MockProjector, BackendError> {
        if self.script.fail_projector {
            return Err(BackendError::Projector(format!("cannot read {}", path.display())));
        }
        record(&self.events, Event::ProjectorLoaded(path.to_path_buf(), params.clone()));
        Ok(MockProjector {
            script: self.script.clone(),
            events: self.events.clone(),
        })
    }
}
