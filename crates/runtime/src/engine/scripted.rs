//! Deterministic in-process engine backend.
//!
//! Stands in for the native engine during development and in the test
//! suites: replies are either scripted ahead of time or synthesized
//! deterministically from the prompt and seed, token pacing is configurable,
//! and the cancel token is honored between tokens exactly like the real
//! engine's cooperative flag.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{EngineConfig, GenerationParams, VisionConfig};
use crate::engine::{
    CancelToken, Completion, EngineBackend, EngineSession, StopReason, StreamEnd,
};
use crate::error::VedaError;
use crate::frame::Frame;

/// One scripted outcome, consumed in FIFO order by inference calls.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this text (tokenized on whitespace).
    Text(String),
    /// Fail immediately with this error.
    Failure(VedaError),
    /// Emit `tokens` tokens of `text`, then fail mid-stream.
    FailAfter {
        /// Text to draw tokens from.
        text: String,
        /// Tokens to emit before failing.
        tokens: u32,
        /// The mid-stream error.
        error: VedaError,
    },
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<ScriptedReply>,
    fail_next_load: Option<VedaError>,
}

/// Deterministic engine backend.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
    token_delay: Duration,
}

impl ScriptedBackend {
    /// Create a backend with no scripted replies and no token pacing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long between streamed tokens (gives cancellation a window).
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Queue a canned reply for the next inference call.
    pub fn push_reply(&self, text: impl Into<String>) {
        self.lock().replies.push_back(ScriptedReply::Text(text.into()));
    }

    /// Queue a failure for the next inference call.
    pub fn push_failure(&self, error: VedaError) {
        self.lock().replies.push_back(ScriptedReply::Failure(error));
    }

    /// Queue a mid-stream failure after `tokens` tokens.
    pub fn push_fail_after(&self, text: impl Into<String>, tokens: u32, error: VedaError) {
        self.lock().replies.push_back(ScriptedReply::FailAfter {
            text: text.into(),
            tokens,
            error,
        });
    }

    /// Make the next `load_text`/`load_vision` fail with this error.
    pub fn fail_next_load(&self, error: VedaError) {
        self.lock().fail_next_load = Some(error);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl EngineBackend for ScriptedBackend {
    fn load_text(&self, config: &EngineConfig) -> Result<Box<dyn EngineSession>, VedaError> {
        config.validate()?;
        if let Some(err) = self.lock().fail_next_load.take() {
            return Err(err);
        }
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            token_delay: self.token_delay,
            seed: config.seed.unwrap_or(0),
            vision: false,
        }))
    }

    fn load_vision(&self, config: &VisionConfig) -> Result<Box<dyn EngineSession>, VedaError> {
        config.validate()?;
        if let Some(err) = self.lock().fail_next_load.take() {
            return Err(err);
        }
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            token_delay: self.token_delay,
            seed: 0,
            vision: true,
        }))
    }

    fn version(&self) -> String {
        "scripted-engine/1".to_string()
    }
}

struct ScriptedSession {
    state: Arc<Mutex<ScriptState>>,
    token_delay: Duration,
    seed: u64,
    vision: bool,
}

/// Words the synthesizer draws from; indexing is seeded so equal
/// (prompt, seed) pairs always produce equal output.
const WORDS: &[&str] = &[
    "signal", "context", "latent", "gradient", "vector", "frame", "token", "tensor", "prompt",
    "stream", "cache", "sample", "logits", "weights", "channel", "window",
];

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn synthesize(prompt: &str, seed: u64, words: usize) -> String {
    let mut state = fnv1a(prompt.as_bytes()) ^ seed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let mut out = Vec::with_capacity(words);
    for _ in 0..words {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        out.push(WORDS[(state >> 33) as usize % WORDS.len()]);
    }
    out.join(" ")
}

impl ScriptedSession {
    fn next_reply(&self) -> Option<ScriptedReply> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replies
            .pop_front()
    }

    /// Resolve the scripted or synthesized token list for one call.
    fn plan(&self, prompt: &str) -> Result<(Vec<String>, Option<(u32, VedaError)>), VedaError> {
        match self.next_reply() {
            Some(ScriptedReply::Failure(err)) => Err(err),
            Some(ScriptedReply::Text(text)) => Ok((tokenize(&text), None)),
            Some(ScriptedReply::FailAfter {
                text,
                tokens,
                error,
            }) => Ok((tokenize(&text), Some((tokens, error)))),
            None => Ok((tokenize(&synthesize(prompt, self.seed, 12)), None)),
        }
    }

    fn run(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelToken,
        mut on_token: Option<&mut dyn FnMut(&str)>,
    ) -> Result<Completion, VedaError> {
        if cancel.is_cancelled() {
            return Err(VedaError::Cancelled {
                tokens_generated: 0,
            });
        }
        let (tokens, fail_after) = self.plan(prompt)?;

        let mut text = String::new();
        let mut emitted: u32 = 0;
        let mut stop_reason = StopReason::EndOfSequence;

        for (idx, word) in tokens.iter().enumerate() {
            if let Some((after, err)) = &fail_after {
                if emitted >= *after {
                    return Err(err.clone());
                }
            }
            if cancel.is_cancelled() {
                return Err(VedaError::Cancelled {
                    tokens_generated: emitted,
                });
            }
            if emitted >= params.max_tokens {
                stop_reason = StopReason::MaxTokens;
                break;
            }
            if params.stop.iter().any(|s| s == word) {
                stop_reason = StopReason::StopString;
                break;
            }

            let piece = if idx == 0 {
                word.clone()
            } else {
                format!(" {word}")
            };
            text.push_str(&piece);
            emitted += 1;
            if let Some(cb) = on_token.as_deref_mut() {
                cb(&piece);
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
        }

        // A mid-stream failure scheduled past the final token still fires.
        if let Some((after, err)) = fail_after {
            if emitted >= after {
                return Err(err);
            }
        }

        Ok(Completion {
            text,
            tokens_generated: emitted,
            stop_reason,
        })
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_owned).collect()
}

impl EngineSession for ScriptedSession {
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelToken,
    ) -> Result<Completion, VedaError> {
        self.run(prompt, params, cancel, None)
    }

    fn stream(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<StreamEnd, VedaError> {
        match self.run(prompt, params, cancel, Some(on_token)) {
            Ok(completion) => Ok(StreamEnd::Done {
                reason: completion.stop_reason,
                tokens_generated: completion.tokens_generated,
            }),
            Err(VedaError::Cancelled { tokens_generated }) => {
                Ok(StreamEnd::Cancelled { tokens_generated })
            }
            Err(err) => Err(err),
        }
    }

    fn describe(
        &mut self,
        frame: &Frame,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelToken,
    ) -> Result<Completion, VedaError> {
        if !self.vision {
            return Err(VedaError::Config(
                "text session cannot describe images".into(),
            ));
        }
        let seeded = format!("{prompt} [{}x{}]", frame.width(), frame.height());
        self.run(&seeded, params, cancel, None)
    }

    fn reset_context(&mut self) -> Result<(), VedaError> {
        Ok(())
    }
}
