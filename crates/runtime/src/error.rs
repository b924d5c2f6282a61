//! Error taxonomy for the runtime.
//!
//! Every user-visible failure carries a human-readable message plus a
//! machine-readable kind ([`VedaError::kind`]). Stack traces never cross the
//! API boundary.

use thiserror::Error;

/// Runtime failure surfaced to callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VedaError {
    /// Invalid parameter values; failed fast at entry, never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The engine refused the model. Fatal to the worker.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// The engine or host ran out of memory.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A serialized operation was attempted while another is in flight.
    /// Recoverable by retry after the current request completes.
    #[error("worker busy")]
    Busy,

    /// The engine reported a runtime error mid-generation.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Cooperative cancellation was observed. Carries the partial token
    /// count; a distinct outcome rather than a failure.
    #[error("cancelled after {tokens_generated} tokens")]
    Cancelled {
        /// Tokens produced before the cancel flag was observed.
        tokens_generated: u32,
    },

    /// Operation attempted on a disposed worker or orchestrator.
    #[error("disposed")]
    Disposed,

    /// The runtime policy disallows this operation at the current QoS level.
    /// Retry after de-escalation.
    #[error("rejected by runtime policy: {0}")]
    PolicyRejected(String),

    /// Estimated tokens exceed the context limit even after summarization.
    /// The session is left unchanged.
    #[error("context overflow: {estimated_tokens} tokens over a {max_context_tokens}-token context")]
    ContextOverflow {
        /// Token estimate that failed to fit.
        estimated_tokens: u32,
        /// Configured context ceiling.
        max_context_tokens: u32,
    },
}

impl VedaError {
    /// Machine-readable kind for logging and cross-language surfaces.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::ModelLoad(_) => "model_load",
            Self::OutOfMemory(_) => "out_of_memory",
            Self::Busy => "engine_busy",
            Self::Generation(_) => "generation",
            Self::Cancelled { .. } => "cancelled",
            Self::Disposed => "disposed",
            Self::PolicyRejected(_) => "policy_rejected",
            Self::ContextOverflow { .. } => "context_overflow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(VedaError::Busy.kind(), "engine_busy");
        assert_eq!(
            VedaError::Cancelled {
                tokens_generated: 3
            }
            .kind(),
            "cancelled"
        );
        assert_eq!(VedaError::Disposed.kind(), "disposed");
    }

    #[test]
    fn messages_carry_context() {
        let err = VedaError::ContextOverflow {
            estimated_tokens: 300,
            max_context_tokens: 128,
        };
        let text = err.to_string();
        assert!(text.contains("300"));
        assert!(text.contains("128"));
    }
}
