//! The seam between the runtime and the inference engine.
//!
//! Workers own exactly one [`EngineSession`] each and are the only code that
//! touches it; everything above the worker reaches the engine through these
//! traits, which makes the backend swappable per target (FFI-backed native
//! engine, scripted offline engine for development and tests).

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, GenerationParams, VisionConfig};
use crate::error::VedaError;
use crate::frame::Frame;

pub mod scripted;

#[cfg(feature = "native-engine")]
pub mod native;

/// Cooperative cancellation token.
///
/// The engine consults the flag between tokens; blocking calls check it at
/// entry. Cancelling is a request, not a preemption.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    /// Create a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(1, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) != 0
    }

    /// The raw atomic byte, for backends that hand a flag pointer to C.
    #[must_use]
    pub fn as_atomic(&self) -> &AtomicU8 {
        &self.0
    }
}

/// Why a generation stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model emitted its end-of-sequence token.
    EndOfSequence,
    /// The `max_tokens` cap was reached.
    MaxTokens,
    /// A configured stop string matched.
    StopString,
}

/// Result of a blocking generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Number of tokens produced.
    pub tokens_generated: u32,
    /// Why generation stopped.
    pub stop_reason: StopReason,
}

/// Terminal outcome of a streaming generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The stream ran to completion.
    Done {
        /// Why it stopped.
        reason: StopReason,
        /// Total tokens emitted.
        tokens_generated: u32,
    },
    /// The cancel token was observed mid-stream.
    Cancelled {
        /// Tokens emitted before cancellation.
        tokens_generated: u32,
    },
}

impl StreamEnd {
    /// Tokens emitted before the stream terminated.
    #[must_use]
    pub fn tokens_generated(&self) -> u32 {
        match self {
            Self::Done {
                tokens_generated, ..
            }
            | Self::Cancelled { tokens_generated } => *tokens_generated,
        }
    }
}

/// One loaded model. Exclusively owned by a single worker thread; calls
/// block that thread for their duration.
pub trait EngineSession: Send {
    /// Run a blocking generation. Checks `cancel` at entry.
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelToken,
    ) -> Result<Completion, VedaError>;

    /// Run a streaming generation, invoking `on_token` per token and
    /// consulting `cancel` between tokens.
    fn stream(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<StreamEnd, VedaError>;

    /// Describe an RGB8 frame. Only vision sessions implement this; text
    /// sessions return [`VedaError::Config`].
    fn describe(
        &mut self,
        frame: &Frame,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelToken,
    ) -> Result<Completion, VedaError>;

    /// Clear the KV cache, keeping the model loaded.
    fn reset_context(&mut self) -> Result<(), VedaError>;
}

/// Factory for engine sessions.
pub trait EngineBackend: Send + Sync + 'static {
    /// Load a text model.
    fn load_text(&self, config: &EngineConfig) -> Result<Box<dyn EngineSession>, VedaError>;

    /// Load a vision-language model.
    fn load_vision(&self, config: &VisionConfig) -> Result<Box<dyn EngineSession>, VedaError>;

    /// Engine version string, for diagnostics.
    fn version(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_sticky_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn stream_end_reports_tokens() {
        let done = StreamEnd::Done {
            reason: StopReason::MaxTokens,
            tokens_generated: 7,
        };
        assert_eq!(done.tokens_generated(), 7);
        let cancelled = StreamEnd::Cancelled {
            tokens_generated: 3,
        };
        assert_eq!(cancelled.tokens_generated(), 3);
    }
}
