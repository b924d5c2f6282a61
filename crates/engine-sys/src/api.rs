//! Safe typed wrappers over the inference engine C API.
//!
//! Ownership contract: every string crossing the boundary is copied on this
//! side. Engine-allocated result strings are freed with `engine_free_string`
//! before any wrapper returns, so no engine-owned pointer ever escapes this
//! module. Cancellation flags live in wrapper-owned [`CancelFlag`]s that
//! outlive any in-flight call.

use std::ffi::{CStr, CString, c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

use crate::ffi;

/// Engine status codes shared with the C wrapper.
pub mod code {
    /// Call succeeded.
    pub const OK: i32 = 0;
    /// The engine refused the model (bad format, missing projector).
    pub const MODEL_LOAD: i32 = 1;
    /// The engine ran out of memory.
    pub const OUT_OF_MEMORY: i32 = 2;
    /// A runtime failure mid-generation.
    pub const GENERATION: i32 = 3;
    /// The cooperative cancel flag was observed.
    pub const CANCELLED: i32 = 4;
}

/// Stream termination reasons reported by `on_done`.
pub mod stop {
    /// The model emitted its end-of-sequence token.
    pub const EOS: i32 = 0;
    /// The `max_tokens` cap was reached.
    pub const MAX_TOKENS: i32 = 1;
    /// A configured stop string matched.
    pub const STOP_STRING: i32 = 2;
}

/// Errors returned by the engine wrappers.
#[derive(Debug, Error)]
pub enum EngineSysError {
    /// One or more inputs are invalid (empty path, interior NUL, ...).
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// The engine refused to load the model.
    #[error("engine rejected model (code {0})")]
    ModelLoad(i32),

    /// The engine ran out of memory.
    #[error("engine out of memory")]
    OutOfMemory,

    /// The engine reported a runtime failure.
    #[error("engine generation failed (code {0})")]
    Generation(i32),

    /// The cooperative cancel flag stopped the call.
    #[error("engine call cancelled")]
    Cancelled,

    /// The engine returned bytes that are not valid UTF-8.
    #[error("engine returned invalid UTF-8")]
    InvalidUtf8,

    /// The engine returned a success code but no output buffer.
    #[error("engine returned no output")]
    MissingOutput,
}

fn status_err(code: i32) -> EngineSysError {
    match code {
        code::MODEL_LOAD => EngineSysError::ModelLoad(code),
        code::OUT_OF_MEMORY => EngineSysError::OutOfMemory,
        code::CANCELLED => EngineSysError::Cancelled,
        other => EngineSysError::Generation(other),
    }
}

/// Wrapper-owned cooperative cancellation flag.
///
/// The flag is heap-allocated behind an `Arc` so it outlives the engine call
/// it is attached to even if the caller drops its clone mid-flight. The inner
/// atomic can also be borrowed directly by [`EngineHandle::stream`], which
/// keeps the byte alive for the duration of the blocking call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicU8>);

impl CancelFlag {
    /// Create a new, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the call observing this flag.
    pub fn set(&self) {
        self.0.store(1, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst) != 0
    }

    /// The underlying atomic byte consulted by the engine between tokens.
    #[must_use]
    pub fn as_atomic(&self) -> &AtomicU8 {
        &self.0
    }
}

fn cancel_ptr(flag: &AtomicU8) -> *const u8 {
    // AtomicU8 has the same layout as u8; the C side reads it with an
    // atomic (or volatile) byte load between tokens.
    std::ptr::from_ref(flag).cast::<u8>()
}

/// Sampling parameters for a single generate/stream/describe call.
#[derive(Debug, Clone)]
pub struct GenParams {
    /// Maximum number of tokens to generate.
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

/// Owned C-side view of [`GenParams`], keeping the stop-string storage alive
/// for the duration of one call.
struct CParams {
    _stop_storage: Vec<CString>,
    _stop_ptrs: Vec<*const c_char>,
    raw: ffi::EngineGenParams,
}

impl CParams {
    fn build(params: &GenParams) -> Result<Self, EngineSysError> {
        let mut stop_storage = Vec::with_capacity(params.stop.len());
        for s in &params.stop {
            stop_storage.push(
                CString::new(s.as_str())
                    .map_err(|_| EngineSysError::InvalidInput("stop string contains NUL"))?,
            );
        }
        let stop_ptrs: Vec<*const c_char> = stop_storage.iter().map(|s| s.as_ptr()).collect();
        let raw = ffi::EngineGenParams {
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            repeat_penalty: params.repeat_penalty,
            stop_strings: if stop_ptrs.is_empty() {
                std::ptr::null()
            } else {
                stop_ptrs.as_ptr()
            },
            stop_count: stop_ptrs.len(),
        };
        Ok(Self {
            _stop_storage: stop_storage,
            _stop_ptrs: stop_ptrs,
            raw,
        })
    }

    fn as_raw(&self) -> *const ffi::EngineGenParams {
        // `raw.stop_strings` points into `_stop_ptrs`'s heap buffer, which is
        // stable for the lifetime of `self`.
        &self.raw
    }
}

/// Copy an engine-allocated string out and free it, in that order.
fn take_string(ptr: *mut c_char) -> Result<String, EngineSysError> {
    if ptr.is_null() {
        return Err(EngineSysError::MissingOutput);
    }
    // SAFETY: The engine returns a heap-allocated, null-terminated UTF-8
    // buffer. We copy it out before freeing it with `engine_free_string`.
    let copied = unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(str::to_owned);
    unsafe { ffi::engine_free_string(ptr) };
    copied.map_err(|_| EngineSysError::InvalidUtf8)
}

struct StreamCtx<'a> {
    on_token: &'a mut dyn FnMut(&str),
    done_reason: Option<i32>,
}

unsafe extern "C" fn token_trampoline(ctx: *mut c_void, token_utf8: *const c_char) {
    if token_utf8.is_null() {
        return;
    }
    let ctx = unsafe { &mut *ctx.cast::<StreamCtx<'_>>() };
    // SAFETY: The engine hands us a null-terminated buffer valid for the
    // duration of this callback; we copy before returning.
    if let Ok(token) = unsafe { CStr::from_ptr(token_utf8) }.to_str() {
        let _ = catch_unwind(AssertUnwindSafe(|| (ctx.on_token)(token)));
    }
}

unsafe extern "C" fn done_trampoline(ctx: *mut c_void, reason: i32) {
    let ctx = unsafe { &mut *ctx.cast::<StreamCtx<'_>>() };
    ctx.done_reason = Some(reason);
}

/// A loaded model inside the engine.
///
/// The handle is exclusively owned: calls take `&mut self`, so two calls can
/// never touch the same engine context concurrently, and the context is freed
/// exactly once on drop.
#[derive(Debug)]
pub struct EngineHandle {
    ptr: NonNull<ffi::EngineCtx>,
}

// SAFETY: The engine context has no thread affinity; exclusive ownership
// (`&mut self` on every call) keeps all access serialized.
unsafe impl Send for EngineHandle {}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from a successful `engine_init`/`engine_vision_init`
        // and is freed exactly once here.
        unsafe { ffi::engine_free(self.ptr.as_ptr()) };
    }
}

impl EngineHandle {
    /// Load a text model.
    ///
    /// `seed` of `None` maps to `-1` (engine picks a nondeterministic seed).
    pub fn init_text(
        model_path: &str,
        context_size: u32,
        gpu_layers: i32,
        threads: u32,
        seed: Option<u64>,
        use_mmap: bool,
        use_mlock: bool,
    ) -> Result<Self, EngineSysError> {
        if model_path.is_empty() {
            return Err(EngineSysError::InvalidInput("model_path must not be empty"));
        }
        let model_path = CString::new(model_path)
            .map_err(|_| EngineSysError::InvalidInput("model_path contains NUL"))?;
        let seed = seed.map_or(-1, |s| s as i64);

        let mut handle: *mut ffi::EngineCtx = std::ptr::null_mut();
        // SAFETY: All pointers are valid for the duration of the call; the
        // out-param is written only on success.
        let rc = unsafe {
            ffi::engine_init(
                model_path.as_ptr(),
                context_size,
                gpu_layers,
                threads,
                seed,
                use_mmap,
                use_mlock,
                std::ptr::addr_of_mut!(handle),
            )
        };
        if rc != code::OK {
            return Err(status_err(rc));
        }
        NonNull::new(handle)
            .map(|ptr| Self { ptr })
            .ok_or(EngineSysError::ModelLoad(code::MODEL_LOAD))
    }

    /// Load a vision-language model with its projector.
    pub fn init_vision(
        model_path: &str,
        projector_path: &str,
        context_size: u32,
        threads: u32,
    ) -> Result<Self, EngineSysError> {
        if model_path.is_empty() {
            return Err(EngineSysError::InvalidInput("model_path must not be empty"));
        }
        if projector_path.is_empty() {
            return Err(EngineSysError::InvalidInput(
                "projector_path must not be empty",
            ));
        }
        let model_path = CString::new(model_path)
            .map_err(|_| EngineSysError::InvalidInput("model_path contains NUL"))?;
        let projector_path = CString::new(projector_path)
            .map_err(|_| EngineSysError::InvalidInput("projector_path contains NUL"))?;

        let mut handle: *mut ffi::EngineCtx = std::ptr::null_mut();
        // SAFETY: Pointers are valid for the call; out-param written on success.
        let rc = unsafe {
            ffi::engine_vision_init(
                model_path.as_ptr(),
                projector_path.as_ptr(),
                context_size,
                threads,
                std::ptr::addr_of_mut!(handle),
            )
        };
        if rc != code::OK {
            return Err(status_err(rc));
        }
        NonNull::new(handle)
            .map(|ptr| Self { ptr })
            .ok_or(EngineSysError::ModelLoad(code::MODEL_LOAD))
    }

    /// Run a blocking generation and return the full completion text.
    pub fn generate(&mut self, prompt: &str, params: &GenParams) -> Result<String, EngineSysError> {
        let prompt = CString::new(prompt)
            .map_err(|_| EngineSysError::InvalidInput("prompt contains NUL"))?;
        let cparams = CParams::build(params)?;

        let mut out: *mut c_char = std::ptr::null_mut();
        // SAFETY: Handle is live (owned by self), all pointers valid for the
        // call, and the result buffer is copied + freed by `take_string`.
        let rc = unsafe {
            ffi::engine_generate(
                self.ptr.as_ptr(),
                prompt.as_ptr(),
                cparams.as_raw(),
                std::ptr::addr_of_mut!(out),
            )
        };
        if rc != code::OK {
            return Err(status_err(rc));
        }
        take_string(out)
    }

    /// Run a streaming generation, invoking `on_token` for each token.
    ///
    /// Blocks until the engine finishes, errors, or observes `cancel`.
    /// Returns the `stop::*` reason on normal completion.
    pub fn stream(
        &mut self,
        prompt: &str,
        params: &GenParams,
        cancel: &AtomicU8,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<i32, EngineSysError> {
        let prompt = CString::new(prompt)
            .map_err(|_| EngineSysError::InvalidInput("prompt contains NUL"))?;
        let cparams = CParams::build(params)?;

        let mut ctx = StreamCtx {
            on_token,
            done_reason: None,
        };
        // SAFETY: The callback context and cancel flag outlive the blocking
        // call; trampolines copy token bytes before returning.
        let rc = unsafe {
            ffi::engine_stream(
                self.ptr.as_ptr(),
                prompt.as_ptr(),
                cparams.as_raw(),
                Some(token_trampoline),
                Some(done_trampoline),
                std::ptr::addr_of_mut!(ctx).cast::<c_void>(),
                cancel_ptr(cancel),
            )
        };
        if rc != code::OK {
            return Err(status_err(rc));
        }
        ctx.done_reason.ok_or(EngineSysError::MissingOutput)
    }

    /// Describe an RGB8 image (row-major, `width * height * 3` bytes).
    pub fn describe(
        &mut self,
        rgb_bytes: &[u8],
        width: u32,
        height: u32,
        prompt: &str,
        params: &GenParams,
    ) -> Result<String, EngineSysError> {
        let expected = width as usize * height as usize * 3;
        if rgb_bytes.len() != expected {
            return Err(EngineSysError::InvalidInput(
                "rgb_bytes must be width * height * 3 bytes",
            ));
        }
        let prompt = CString::new(prompt)
            .map_err(|_| EngineSysError::InvalidInput("prompt contains NUL"))?;
        let cparams = CParams::build(params)?;

        let mut out: *mut c_char = std::ptr::null_mut();
        // SAFETY: Pixel buffer, prompt and params are valid for the call; the
        // result buffer is copied + freed by `take_string`.
        let rc = unsafe {
            ffi::engine_describe(
                self.ptr.as_ptr(),
                rgb_bytes.as_ptr(),
                width,
                height,
                prompt.as_ptr(),
                cparams.as_raw(),
                std::ptr::addr_of_mut!(out),
            )
        };
        if rc != code::OK {
            return Err(status_err(rc));
        }
        take_string(out)
    }

    /// Clear the KV cache, keeping the model loaded.
    pub fn reset_context(&mut self) -> Result<(), EngineSysError> {
        // SAFETY: Handle is live and exclusively borrowed.
        let rc = unsafe { ffi::engine_reset_context(self.ptr.as_ptr()) };
        if rc != code::OK {
            return Err(status_err(rc));
        }
        Ok(())
    }
}

/// Process resident-set size as reported by the engine, in bytes.
#[must_use]
pub fn rss_bytes() -> u64 {
    // SAFETY: No pointers involved.
    unsafe { ffi::engine_rss_bytes() }
}

/// Memory still available to this process, in bytes.
#[must_use]
pub fn available_bytes() -> u64 {
    // SAFETY: No pointers involved.
    unsafe { ffi::engine_available_bytes() }
}

/// Engine version string.
#[must_use]
pub fn version() -> String {
    // SAFETY: The engine returns a pointer to a static, null-terminated
    // string that must not be freed.
    let ptr = unsafe { ffi::engine_version() };
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}
