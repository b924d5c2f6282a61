//! Typed configuration records.
//!
//! There is no CLI or config-file surface; callers construct these records
//! directly and every entry point validates fail-fast.

use std::path::PathBuf;

use crate::error::VedaError;

/// Configuration for loading a text model.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the model file.
    pub model_path: PathBuf,
    /// KV cache size in tokens.
    pub context_size: u32,
    /// GPU layers to offload; `-1` means all.
    pub gpu_layers: i32,
    /// CPU thread count.
    pub threads: u32,
    /// RNG seed; `None` is nondeterministic.
    pub seed: Option<u64>,
    /// Advisory memory limit; exceeding it triggers the pressure callback.
    pub memory_limit_bytes: Option<u64>,
    /// Memory-map model bytes instead of reading them.
    pub use_mmap: bool,
    /// Lock model pages in RAM.
    pub use_mlock: bool,
}

impl EngineConfig {
    /// Default KV cache size in tokens.
    pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;

    /// Build a config with defaults for everything but the model path.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            context_size: Self::DEFAULT_CONTEXT_SIZE,
            gpu_layers: -1,
            threads: default_threads(),
            seed: None,
            memory_limit_bytes: None,
            use_mmap: true,
            use_mlock: false,
        }
    }

    /// Validate parameter values; called at every entry point that loads.
    pub fn validate(&self) -> Result<(), VedaError> {
        if self.model_path.as_os_str().is_empty() {
            return Err(VedaError::Config("model_path is required".into()));
        }
        if self.context_size == 0 {
            return Err(VedaError::Config("context_size must be > 0".into()));
        }
        if self.threads == 0 {
            return Err(VedaError::Config("threads must be > 0".into()));
        }
        if self.gpu_layers < -1 {
            return Err(VedaError::Config(format!(
                "gpu_layers must be >= -1 (got {})",
                self.gpu_layers
            )));
        }
        Ok(())
    }
}

/// Configuration for loading a vision-language model.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    /// Path to the vision backbone model file.
    pub model_path: PathBuf,
    /// Path to the multimodal projector file.
    pub projector_path: PathBuf,
    /// KV cache size in tokens.
    pub context_size: u32,
    /// CPU thread count.
    pub threads: u32,
}

impl VisionConfig {
    /// Build a config with defaults for everything but the paths.
    pub fn new(model_path: impl Into<PathBuf>, projector_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            projector_path: projector_path.into(),
            context_size: EngineConfig::DEFAULT_CONTEXT_SIZE,
            threads: default_threads(),
        }
    }

    /// Validate parameter values.
    pub fn validate(&self) -> Result<(), VedaError> {
        if self.model_path.as_os_str().is_empty() {
            return Err(VedaError::Config("model_path is required".into()));
        }
        if self.projector_path.as_os_str().is_empty() {
            return Err(VedaError::Config("projector_path is required".into()));
        }
        if self.context_size == 0 {
            return Err(VedaError::Config("context_size must be > 0".into()));
        }
        if self.threads == 0 {
            return Err(VedaError::Config("threads must be > 0".into()));
        }
        Ok(())
    }
}

/// Sampling parameters for one generation request.
///
/// The runtime applies `min(request, qos_override)` caps before the request
/// reaches the engine, so these are the caller's upper bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Softmax temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// Top-k sampling cutoff.
    pub top_k: u32,
    /// Repetition penalty.
    pub repeat_penalty: f32,
    /// Stop strings; generation halts when one is produced.
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 128,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            stop: Vec::new(),
        }
    }
}

impl GenerationParams {
    /// Validate parameter values; called at every inference entry point.
    pub fn validate(&self) -> Result<(), VedaError> {
        if self.max_tokens == 0 {
            return Err(VedaError::Config("max_tokens must be > 0".into()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(VedaError::Config(format!(
                "temperature must be finite and >= 0 (got {})",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(VedaError::Config(format!(
                "top_p must be in (0, 1] (got {})",
                self.top_p
            )));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(VedaError::Config(format!(
                "repeat_penalty must be > 0 (got {})",
                self.repeat_penalty
            )));
        }
        Ok(())
    }

    /// Copy with `max_tokens` capped at `cap`.
    #[must_use]
    pub fn capped_max_tokens(&self, cap: u32) -> Self {
        let mut out = self.clone();
        out.max_tokens = out.max_tokens.min(cap.max(1));
        out
    }
}

fn default_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let cfg = EngineConfig::new("/models/tiny.gguf");
        assert_eq!(cfg.context_size, 2048);
        assert_eq!(cfg.gpu_layers, -1);
        assert!(cfg.threads >= 1);
        assert!(cfg.use_mmap);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_model_path_is_rejected() {
        let cfg = EngineConfig::new("");
        assert!(matches!(cfg.validate(), Err(VedaError::Config(_))));
    }

    #[test]
    fn generation_params_bounds() {
        let mut p = GenerationParams::default();
        assert!(p.validate().is_ok());

        p.max_tokens = 0;
        assert!(p.validate().is_err());

        p = GenerationParams {
            top_p: 1.5,
            ..GenerationParams::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn capped_max_tokens_takes_the_min() {
        let p = GenerationParams {
            max_tokens: 200,
            ..GenerationParams::default()
        };
        assert_eq!(p.capped_max_tokens(75).max_tokens, 75);
        assert_eq!(p.capped_max_tokens(400).max_tokens, 200);
    }
}
