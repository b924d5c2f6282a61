//! FFI declarations for the inference engine C wrapper.

use std::ffi::{c_char, c_void};

/// Opaque engine context behind every loaded model.
#[repr(C)]
pub(crate) struct EngineCtx {
    _private: [u8; 0],
}

/// Sampling parameters passed by value across the boundary.
#[repr(C)]
pub(crate) struct EngineGenParams {
    pub(crate) max_tokens: u32,
    pub(crate) temperature: f32,
    pub(crate) top_p: f32,
    pub(crate) top_k: u32,
    pub(crate) repeat_penalty: f32,
    /// Null-terminated UTF-8 stop strings (array of `stop_count` pointers).
    pub(crate) stop_strings: *const *const c_char,
    pub(crate) stop_count: usize,
}

/// Invoked once per generated token with a null-terminated UTF-8 piece.
pub(crate) type TokenCallback = unsafe extern "C" fn(ctx: *mut c_void, token_utf8: *const c_char);

/// Invoked exactly once when a streaming call ends; `reason` is one of the
/// `ENGINE_STOP_*` constants.
pub(crate) type DoneCallback = unsafe extern "C" fn(ctx: *mut c_void, reason: i32);

unsafe extern "C" {
    pub(crate) fn engine_init(
        model_path: *const c_char,
        context_size: u32,
        gpu_layers: i32,
        threads: u32,
        seed: i64,
        use_mmap: bool,
        use_mlock: bool,
        out_handle: *mut *mut EngineCtx,
    ) -> i32;

    pub(crate) fn engine_vision_init(
        model_path: *const c_char,
        projector_path: *const c_char,
        context_size: u32,
        threads: u32,
        out_handle: *mut *mut EngineCtx,
    ) -> i32;

    pub(crate) fn engine_free(handle: *mut EngineCtx);

    pub(crate) fn engine_generate(
        handle: *mut EngineCtx,
        prompt_utf8: *const c_char,
        params: *const EngineGenParams,
        out_text: *mut *mut c_char,
    ) -> i32;

    pub(crate) fn engine_stream(
        handle: *mut EngineCtx,
        prompt_utf8: *const c_char,
        params: *const EngineGenParams,
        on_token: Option<TokenCallback>,
        on_done: Option<DoneCallback>,
        callback_ctx: *mut c_void,
        // Read atomically between tokens; non-zero requests cancellation.
        cancel_flag: *const u8,
    ) -> i32;

    pub(crate) fn engine_describe(
        handle: *mut EngineCtx,
        rgb_bytes: *const u8,
        width: u32,
        height: u32,
        prompt_utf8: *const c_char,
        params: *const EngineGenParams,
        out_text: *mut *mut c_char,
    ) -> i32;

    pub(crate) fn engine_reset_context(handle: *mut EngineCtx) -> i32;

    pub(crate) fn engine_free_string(ptr: *mut c_char);

    pub(crate) fn engine_rss_bytes() -> u64;

    pub(crate) fn engine_available_bytes() -> u64;

    pub(crate) fn engine_version() -> *const c_char;
}
