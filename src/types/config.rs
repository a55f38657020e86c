//! Engine configuration
//!
//! Tunable execution parameters and the all-or-nothing configure operation.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest image token budget a projector is ever built with.
pub const IMAGE_MIN_TOKENS: u32 = 32;

/// Largest accepted value for any count field
pub const MAX_COUNT: u32 = i32::MAX as u32;

/// Errors raised while applying a configuration update
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse engine config: {0}")]
    ParseFailure(#[from] serde_json::Error),

    #[error("Config field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: u32 },
}

/// KV cache element type requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCacheKind {
    /// Engine default precision
    Default,
    /// 8-bit quantized keys and values
    Q8_0,
}

/// Execution parameters for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Threads used for single-token decoding
    pub n_threads: u32,
    /// Threads used for prompt (batch) decoding
    pub n_threads_batch: u32,
    /// Context window length in tokens
    pub n_ctx: u32,
    /// Logical batch size; the physical sub-batch is half of it
    pub n_batch: u32,
    /// Upper bound on tokens a single image may expand to
    pub img_max_tokens: u32,
    /// Quantize both KV caches to 8 bits
    pub kv_quant: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_threads: 4,
            n_threads_batch: 4,
            n_ctx: 2048,
            n_batch: 512,
            img_max_tokens: 128,
            kv_quant: true,
        }
    }
}

/// A parsed configure request. Absent fields leave the current value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigUpdate {
    pub n_threads: Option<NonZeroU32>,
    pub n_threads_batch: Option<NonZeroU32>,
    pub n_ctx: Option<NonZeroU32>,
    pub n_batch: Option<NonZeroU32>,
    pub img_max_tokens: Option<NonZeroU32>,
    pub kv_quant: Option<bool>,
}

impl ConfigUpdate {
    /// Parses and validates an update without touching any config.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let update: ConfigUpdate = serde_json::from_str(json)?;
        update.validate()?;
        Ok(update)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("n_threads", self.n_threads),
            ("n_threads_batch", self.n_threads_batch),
            ("n_ctx", self.n_ctx),
            ("n_batch", self.n_batch),
            ("img_max_tokens", self.img_max_tokens),
        ];
        for (field, value) in counts {
            // The engine takes these as signed 32-bit counts
            if let Some(value) = value.filter(|v| v.get() > MAX_COUNT) {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: value.get(),
                });
            }
        }

        if let Some(n_batch) = self.n_batch {
            if n_batch.get() < 2 {
                return Err(ConfigError::OutOfRange {
                    field: "n_batch",
                    value: n_batch.get(),
                });
            }
        }
        Ok(())
    }

    /// Writes every present field into `config`.
    pub fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(v) = self.n_threads {
            config.n_threads = v.get();
        }
        if let Some(v) = self.n_threads_batch {
            config.n_threads_batch = v.get();
        }
        if let Some(v) = self.n_ctx {
            config.n_ctx = v.get();
        }
        if let Some(v) = self.n_batch {
            config.n_batch = v.get();
        }
        if let Some(v) = self.img_max_tokens {
            config.img_max_tokens = v.get();
        }
        if let Some(v) = self.kv_quant {
            config.kv_quant = v;
        }
    }
}

impl EngineConfig {
    /// Applies a JSON update. On error the config is left exactly as it was.
    pub fn configure(&mut self, json: &str) -> Result<(), ConfigError> {
        let update = ConfigUpdate::parse(json)?;
        update.apply_to(self);
        tracing::debug!(
            "Config applied: thr={}, ctx={}, batch={}, kv_quant={}",
            self.n_threads,
            self.n_ctx,
            self.n_batch,
            self.kv_quant
        );
        Ok(())
    }

    /// Physical sub-batch size handed to the engine
    pub fn n_ubatch(&self) -> u32 {
        (self.n_batch / 2).max(1)
    }

    pub fn kv_cache(&self) -> KvCacheKind {
        if self.kv_quant {
            KvCacheKind::Q8_0
        } else {
            KvCacheKind::Default
        }
    }

    /// Image token budget as `(min, max)`, with `max` never below the minimum.
    pub fn image_token_budget(&self) -> (u32, u32) {
        (IMAGE_MIN_TOKENS, self.img_max_tokens.max(IMAGE_MIN_TOKENS))
    }
}
