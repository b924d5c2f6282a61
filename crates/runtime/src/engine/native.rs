//! FFI-backed engine backend (`native-engine` feature).
//!
//! Bridges the [`EngineBackend`]/[`EngineSession`] seam onto the
//! `edge-veda-engine-sys` wrappers. The engine does not report usage counts
//! for blocking calls, so token counts on that path are whitespace-token
//! estimates; streaming counts are exact.

use edge_veda_engine_sys as sys;

use crate::config::{EngineConfig, GenerationParams, VisionConfig};
use crate::engine::{
    CancelToken, Completion, EngineBackend, EngineSession, StopReason, StreamEnd,
};
use crate::error::VedaError;
use crate::frame::Frame;

/// Engine backend that drives the native inference library.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl NativeBackend {
    /// Create the backend. Loading models requires the native library to be
    /// linked (see the `engine-sys` build script).
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn path_str(path: &std::path::Path) -> Result<&str, VedaError> {
    path.to_str()
        .ok_or_else(|| VedaError::Config("model path is not valid UTF-8".into()))
}

fn to_sys_params(params: &GenerationParams) -> sys::GenParams {
    sys::GenParams {
        max_tokens: params.max_tokens,
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
        repeat_penalty: params.repeat_penalty,
        stop: params.stop.clone(),
    }
}

fn map_err(err: sys::EngineSysError, tokens_generated: u32) -> VedaError {
    match err {
        sys::EngineSysError::InvalidInput(msg) => VedaError::Config(msg.to_string()),
        sys::EngineSysError::ModelLoad(code) => {
            VedaError::ModelLoad(format!("engine rejected model (code {code})"))
        }
        sys::EngineSysError::OutOfMemory => VedaError::OutOfMemory("engine allocation failed".into()),
        sys::EngineSysError::Cancelled => VedaError::Cancelled { tokens_generated },
        other => VedaError::Generation(other.to_string()),
    }
}

fn map_stop(reason: i32) -> StopReason {
    match reason {
        sys::stop::MAX_TOKENS => StopReason::MaxTokens,
        sys::stop::STOP_STRING => StopReason::StopString,
        _ => StopReason::EndOfSequence,
    }
}

impl EngineBackend for NativeBackend {
    fn load_text(&self, config: &EngineConfig) -> Result<Box<dyn EngineSession>, VedaError> {
        config.validate()?;
        let handle = sys::EngineHandle::init_text(
            path_str(&config.model_path)?,
            config.context_size,
            config.gpu_layers,
            config.threads,
            config.seed,
            config.use_mmap,
            config.use_mlock,
        )
        .map_err(|e| map_err(e, 0))?;
        Ok(Box::new(NativeSession {
            handle,
            vision: false,
        }))
    }

    fn load_vision(&self, config: &VisionConfig) -> Result<Box<dyn EngineSession>, VedaError> {
        config.validate()?;
        let handle = sys::EngineHandle::init_vision(
            path_str(&config.model_path)?,
            path_str(&config.projector_path)?,
            config.context_size,
            config.threads,
        )
        .map_err(|e| map_err(e, 0))?;
        Ok(Box::new(NativeSession {
            handle,
            vision: true,
        }))
    }

    fn version(&self) -> String {
        sys::version()
    }
}

struct NativeSession {
    handle: sys::EngineHandle,
    vision: bool,
}

impl EngineSession for NativeSession {
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelToken,
    ) -> Result<Completion, VedaError> {
        if cancel.is_cancelled() {
            return Err(VedaError::Cancelled {
                tokens_generated: 0,
            });
        }
        let text = self
            .handle
            .generate(prompt, &to_sys_params(params))
            .map_err(|e| map_err(e, 0))?;
        let tokens_generated = text.split_whitespace().count() as u32;
        Ok(Completion {
            text,
            tokens_generated,
            stop_reason: StopReason::EndOfSequence,
        })
    }

    fn stream(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<StreamEnd, VedaError> {
        if cancel.is_cancelled() {
            return Ok(StreamEnd::Cancelled {
                tokens_generated: 0,
            });
        }
        let mut count: u32 = 0;
        let mut forward = |token: &str| {
            count += 1;
            on_token(token);
        };
        let result = self.handle.stream(
            prompt,
            &to_sys_params(params),
            cancel.as_atomic(),
            &mut forward,
        );
        match result {
            Ok(reason) => Ok(StreamEnd::Done {
                reason: map_stop(reason),
                tokens_generated: count,
            }),
            Err(sys::EngineSysError::Cancelled) => Ok(StreamEnd::Cancelled {
                tokens_generated: count,
            }),
            Err(err) => Err(map_err(err, count)),
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
        if cancel.is_cancelled() {
            return Err(VedaError::Cancelled {
                tokens_generated: 0,
            });
        }
        let text = self
            .handle
            .describe(
                frame.pixels(),
                frame.width(),
                frame.height(),
                prompt,
                &to_sys_params(params),
            )
            .map_err(|e| map_err(e, 0))?;
        let tokens_generated = text.split_whitespace().count() as u32;
        Ok(Completion {
            text,
            tokens_generated,
            stop_reason: StopReason::EndOfSequence,
        })
    }

    fn reset_context(&mut self) -> Result<(), VedaError> {
        self.handle.reset_context().map_err(|e| map_err(e, 0))
    }
}
