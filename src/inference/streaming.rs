//! Streaming inference support
//!
//! Handles token-by-token delivery of generated text to a consumer.

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::inference::generation::GenerationReport;

/// Represents an item emitted on a generation stream.
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// Generation finished; carries how and why it stopped
    Done(GenerationReport),
    /// The request could not be started
    Error(String),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done(_))
    }

    /// Returns true if the request failed to start
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamToken::Error(s) => Some(s),
            _ => None,
        }
    }
}

/// The consumer of a stream went away
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Stream consumer disconnected")]
pub struct SinkClosed;

/// Receives text fragments synchronously, one at a time, in order.
pub trait TokenSink {
    fn emit(&mut self, fragment: &str) -> Result<(), SinkClosed>;
}

impl<F: FnMut(&str)> TokenSink for F {
    fn emit(&mut self, fragment: &str) -> Result<(), SinkClosed> {
        self(fragment);
        Ok(())
    }
}

/// Forwards fragments into an async channel as [`StreamToken::Token`] items
#[derive(Debug, Clone)]
pub struct ChannelSink(pub UnboundedSender<StreamToken>);

impl ChannelSink {
    /// Sends a terminal item. Returns false if the receiver is gone.
    pub fn finish(&self, last: StreamToken) -> bool {
        self.0.send(last).is_ok()
    }
}

impl TokenSink for ChannelSink {
    fn emit(&mut self, fragment: &str) -> Result<(), SinkClosed> {
        self.0
            .send(StreamToken::Token(fragment.to_string()))
            .map_err(|_| SinkClosed)
    }
}

/// Joins raw token pieces into valid UTF-8 text.
///
/// Tokens can split a multi-byte character; the incomplete tail is held back
/// until the next piece completes it. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a piece and returns whatever text is now complete (possibly empty).
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flushes any held-back bytes, lossily.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
