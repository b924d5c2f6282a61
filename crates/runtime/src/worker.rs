//! Persistent inference workers.
//!
//! A worker is a dedicated OS thread owning exactly one engine session. It
//! services a bounded(1) request queue in FIFO order; engine calls block the
//! worker thread, never the caller's executor. Cancel and dispose travel
//! out-of-band through shared atomics so they reach a worker that is deep
//! inside a blocking engine call.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{EngineConfig, GenerationParams, VisionConfig};
use crate::engine::{CancelToken, Completion, EngineBackend, EngineSession, StreamEnd};
use crate::error::VedaError;
use crate::frame::Frame;
use crate::scheduler::WorkloadId;
use crate::trace::{PerfTrace, TraceEventBody};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No model loaded; a failed load parks the worker here.
    Uninitialized,
    /// Model load in progress.
    Loading,
    /// Idle with a loaded model.
    Ready,
    /// One inference request in flight.
    Generating,
    /// Engine handle freed; all operations are refused.
    Disposed,
}

const STATE_UNINITIALIZED: u8 = 0;
const STATE_LOADING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_GENERATING: u8 = 3;
const STATE_DISPOSED: u8 = 4;

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_LOADING => Self::Loading,
            STATE_READY => Self::Ready,
            STATE_GENERATING => Self::Generating,
            STATE_DISPOSED => Self::Disposed,
            _ => Self::Uninitialized,
        }
    }
}

/// What kind of model a worker hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Text generation model.
    Text,
    /// Vision-language model.
    Vision,
}

impl WorkerKind {
    fn workload(self) -> WorkloadId {
        match self {
            Self::Text => WorkloadId::Text,
            Self::Vision => WorkloadId::Vision,
        }
    }
}

/// Unsolicited worker events, broadcast to any number of subscribers.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A request entered the engine.
    GenerationStarted {
        /// Request identifier.
        request_id: u64,
    },
    /// A streamed token was produced.
    TokenEmitted {
        /// Request identifier.
        request_id: u64,
        /// Token text.
        token: String,
    },
    /// A request left the engine (any outcome).
    GenerationCompleted {
        /// Request identifier.
        request_id: u64,
        /// Tokens produced.
        tokens_generated: u32,
        /// End-to-end latency in milliseconds.
        latency_ms: u64,
        /// Tokens per second over the request.
        tokens_per_sec: f64,
        /// Machine-readable outcome kind (`ok`, `cancelled`, ...).
        outcome: String,
    },
    /// The engine survived a memory-pressure episode.
    MemoryPressureHandled {
        /// Human-readable detail.
        detail: String,
    },
}

enum Request {
    Generate {
        request_id: u64,
        prompt: String,
        params: GenerationParams,
        cancel: CancelToken,
        reply: oneshot::Sender<Result<Completion, VedaError>>,
    },
    Stream {
        request_id: u64,
        prompt: String,
        params: GenerationParams,
        cancel: CancelToken,
        tokens: mpsc::UnboundedSender<String>,
        reply: oneshot::Sender<Result<StreamEnd, VedaError>>,
    },
    Describe {
        request_id: u64,
        frame: Frame,
        prompt: String,
        params: GenerationParams,
        cancel: CancelToken,
        reply: oneshot::Sender<Result<Completion, VedaError>>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), VedaError>>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
struct WorkerShared {
    state: AtomicU8,
    dispose_requested: AtomicBool,
    active_cancel: Mutex<Option<CancelToken>>,
    next_request_id: AtomicU64,
}

impl WorkerShared {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn store_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }

    fn install_cancel(&self, token: CancelToken) {
        *self
            .active_cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
    }

    fn clear_cancel(&self) {
        *self
            .active_cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    fn cancel_active(&self) {
        if let Some(token) = self
            .active_cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }
}

/// A finite, non-restartable token stream from [`WorkerHandle::stream`].
#[derive(Debug)]
pub struct StreamingGeneration {
    request_id: u64,
    tokens: mpsc::UnboundedReceiver<String>,
    done: Option<oneshot::Receiver<Result<StreamEnd, VedaError>>>,
}

impl StreamingGeneration {
    /// Request identifier, for correlating events and trace records.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Next token, or `None` once the stream has ended.
    pub async fn next_token(&mut self) -> Option<String> {
        self.tokens.recv().await
    }

    /// Await the terminal outcome. Undelivered tokens are discarded.
    pub async fn finish(mut self) -> Result<StreamEnd, VedaError> {
        match self.done.take() {
            Some(rx) => rx.await.map_err(|_| VedaError::Disposed)?,
            None => Err(VedaError::Disposed),
        }
    }
}

/// Client handle to one worker. Cheap to clone; all clones address the same
/// worker thread.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    kind: WorkerKind,
    tx: mpsc::Sender<Request>,
    shared: Arc<WorkerShared>,
    events: broadcast::Sender<WorkerEvent>,
    join: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl WorkerHandle {
    /// Spawn a text worker: starts the thread, loads the model, and resolves
    /// once the worker is `Ready` (or the load failed).
    pub async fn spawn_text(
        backend: Arc<dyn EngineBackend>,
        config: EngineConfig,
        trace: Option<PerfTrace>,
    ) -> Result<Self, VedaError> {
        config.validate()?;
        let loader: Loader = Box::new(move || backend.load_text(&config));
        Self::spawn(WorkerKind::Text, loader, trace).await
    }

    /// Spawn a vision worker.
    pub async fn spawn_vision(
        backend: Arc<dyn EngineBackend>,
        config: VisionConfig,
        trace: Option<PerfTrace>,
    ) -> Result<Self, VedaError> {
        config.validate()?;
        let loader: Loader = Box::new(move || backend.load_vision(&config));
        Self::spawn(WorkerKind::Vision, loader, trace).await
    }

    async fn spawn(
        kind: WorkerKind,
        loader: Loader,
        trace: Option<PerfTrace>,
    ) -> Result<Self, VedaError> {
        // Inference queue is bounded(1): one request may wait while one runs.
        let (tx, rx) = mpsc::channel::<Request>(1);
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(WorkerShared {
            state: AtomicU8::new(STATE_LOADING),
            dispose_requested: AtomicBool::new(false),
            active_cancel: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        });
        let (init_tx, init_rx) = oneshot::channel::<Result<(), VedaError>>();

        let thread_shared = Arc::clone(&shared);
        let thread_events = events.clone();
        let thread_name = match kind {
            WorkerKind::Text => "veda-text-worker",
            WorkerKind::Vision => "veda-vision-worker",
        };
        let join = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                worker_main(kind, loader, rx, thread_shared, thread_events, trace, init_tx);
            })
            .map_err(|err| VedaError::Generation(format!("failed to spawn worker thread: {err}")))?;

        match init_rx.await {
            Ok(Ok(())) => Ok(Self {
                kind,
                tx,
                shared,
                events,
                join: Arc::new(Mutex::new(Some(join))),
            }),
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(VedaError::ModelLoad("worker exited during load".into()))
            }
        }
    }

    /// Which model family this worker hosts.
    #[must_use]
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Subscribe to the worker's event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Claim the single inference slot: `Ready -> Generating`.
    fn claim(&self) -> Result<(), VedaError> {
        match self.shared.state.compare_exchange(
            STATE_READY,
            STATE_GENERATING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(STATE_DISPOSED) => Err(VedaError::Disposed),
            Err(STATE_UNINITIALIZED) => {
                Err(VedaError::ModelLoad("worker has no loaded model".into()))
            }
            Err(_) => Err(VedaError::Busy),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.shared.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, request: Request) -> Result<(), VedaError> {
        if self.tx.send(request).await.is_err() {
            // Worker thread is gone; reflect that in the state machine.
            self.shared.store_state(STATE_DISPOSED);
            return Err(VedaError::Disposed);
        }
        Ok(())
    }

    /// Run a blocking generation.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Completion, VedaError> {
        params.validate()?;
        self.claim()?;
        let cancel = CancelToken::new();
        self.shared.install_cancel(cancel.clone());
        let request_id = self.next_request_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Request::Generate {
            request_id,
            prompt: prompt.to_string(),
            params: params.clone(),
            cancel,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| VedaError::Disposed)?
    }

    /// Start a streaming generation.
    pub async fn stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<StreamingGeneration, VedaError> {
        params.validate()?;
        self.claim()?;
        let cancel = CancelToken::new();
        self.shared.install_cancel(cancel.clone());
        let request_id = self.next_request_id();
        let (token_tx, token_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Request::Stream {
            request_id,
            prompt: prompt.to_string(),
            params: params.clone(),
            cancel,
            tokens: token_tx,
            reply: reply_tx,
        })
        .await?;
        Ok(StreamingGeneration {
            request_id,
            tokens: token_rx,
            done: Some(reply_rx),
        })
    }

    /// Describe an image. Refused on text workers.
    pub async fn describe_image(
        &self,
        frame: Frame,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Completion, VedaError> {
        if self.kind != WorkerKind::Vision {
            return Err(VedaError::Config(
                "describe_image requires a vision worker".into(),
            ));
        }
        params.validate()?;
        self.claim()?;
        let cancel = CancelToken::new();
        self.shared.install_cancel(cancel.clone());
        let request_id = self.next_request_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Request::Describe {
            request_id,
            frame,
            prompt: prompt.to_string(),
            params: params.clone(),
            cancel,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| VedaError::Disposed)?
    }

    /// Cancel the currently executing request, if any. Affects only the
    /// in-flight request, never queued ones.
    pub fn cancel(&self) {
        self.shared.cancel_active();
    }

    /// Clear the KV cache, keeping the model loaded. Queued behind any
    /// in-flight request.
    pub async fn reset(&self) -> Result<(), VedaError> {
        if self.shared.state() == WorkerState::Disposed {
            return Err(VedaError::Disposed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Request::Reset { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| VedaError::Disposed)?
    }

    /// Free the engine handle and stop the worker thread. Idempotent; any
    /// in-flight request is cancelled first.
    pub async fn dispose(&self) -> Result<(), VedaError> {
        if self.shared.dispose_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.cancel_active();

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Request::Dispose { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
        self.shared.store_state(STATE_DISPOSED);

        let join = self
            .join
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            let _ = tokio::task::spawn_blocking(move || join.join()).await;
        }
        Ok(())
    }
}

type Loader = Box<dyn FnOnce() -> Result<Box<dyn EngineSession>, VedaError> + Send>;

fn outcome_of<T>(result: &Result<T, VedaError>) -> String {
    match result {
        Ok(_) => "ok".to_string(),
        Err(err) => err.kind().to_string(),
    }
}

struct RequestScope<'a> {
    shared: &'a WorkerShared,
    events: &'a broadcast::Sender<WorkerEvent>,
    trace: Option<&'a PerfTrace>,
    workload: WorkloadId,
    request_id: u64,
    started: Instant,
}

impl<'a> RequestScope<'a> {
    fn begin(
        shared: &'a WorkerShared,
        events: &'a broadcast::Sender<WorkerEvent>,
        trace: Option<&'a PerfTrace>,
        workload: WorkloadId,
        request_id: u64,
    ) -> Self {
        shared.store_state(STATE_GENERATING);
        let _ = events.send(WorkerEvent::GenerationStarted { request_id });
        if let Some(trace) = trace {
            trace.emit(
                TraceEventBody::InferenceStart { request_id },
                Some(workload),
            );
        }
        Self {
            shared,
            events,
            trace,
            workload,
            request_id,
            started: Instant::now(),
        }
    }

    fn end(self, tokens_generated: u32, outcome: &str) {
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let tokens_per_sec = if latency_ms > 0 {
            f64::from(tokens_generated) * 1000.0 / latency_ms as f64
        } else {
            f64::from(tokens_generated) * 1000.0
        };
        let _ = self.events.send(WorkerEvent::GenerationCompleted {
            request_id: self.request_id,
            tokens_generated,
            latency_ms,
            tokens_per_sec,
            outcome: outcome.to_string(),
        });
        if let Some(trace) = self.trace {
            trace.emit(
                TraceEventBody::InferenceEnd {
                    request_id: self.request_id,
                    latency_ms,
                    tokens: tokens_generated,
                    outcome: outcome.to_string(),
                },
                Some(self.workload),
            );
        }
        self.shared.clear_cancel();
        if !self.shared.dispose_requested.load(Ordering::SeqCst) {
            self.shared.store_state(STATE_READY);
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn worker_main(
    kind: WorkerKind,
    loader: Loader,
    mut rx: mpsc::Receiver<Request>,
    shared: Arc<WorkerShared>,
    events: broadcast::Sender<WorkerEvent>,
    trace: Option<PerfTrace>,
    init_tx: oneshot::Sender<Result<(), VedaError>>,
) {
    let mut session = match loader() {
        Ok(session) => {
            shared.store_state(STATE_READY);
            let _ = init_tx.send(Ok(()));
            session
        }
        Err(err) => {
            // A failed load is fatal: no engine handle was ever allocated.
            shared.store_state(STATE_UNINITIALIZED);
            let _ = init_tx.send(Err(err));
            return;
        }
    };
    let workload = kind.workload();

    while let Some(request) = rx.blocking_recv() {
        let disposing = shared.dispose_requested.load(Ordering::SeqCst);
        match request {
            Request::Generate {
                request_id,
                prompt,
                params,
                cancel,
                reply,
            } => {
                if disposing {
                    let _ = reply.send(Err(VedaError::Disposed));
                    continue;
                }
                let scope = RequestScope::begin(
                    &shared,
                    &events,
                    trace.as_ref(),
                    workload,
                    request_id,
                );
                let result = session.generate(&prompt, &params, &cancel);
                note_memory_pressure(&events, &result);
                let tokens = match &result {
                    Ok(completion) => completion.tokens_generated,
                    Err(VedaError::Cancelled { tokens_generated }) => *tokens_generated,
                    Err(_) => 0,
                };
                scope.end(tokens, &outcome_of(&result));
                let _ = reply.send(result);
            }
            Request::Stream {
                request_id,
                prompt,
                params,
                cancel,
                tokens,
                reply,
            } => {
                if disposing {
                    let _ = reply.send(Err(VedaError::Disposed));
                    continue;
                }
                let scope = RequestScope::begin(
                    &shared,
                    &events,
                    trace.as_ref(),
                    workload,
                    request_id,
                );
                let events_for_tokens = events.clone();
                let mut forward = |token: &str| {
                    let _ = tokens.send(token.to_string());
                    let _ = events_for_tokens.send(WorkerEvent::TokenEmitted {
                        request_id,
                        token: token.to_string(),
                    });
                };
                let result = session.stream(&prompt, &params, &cancel, &mut forward);
                drop(tokens);
                let (count, outcome) = match &result {
                    Ok(end) => (
                        end.tokens_generated(),
                        match end {
                            StreamEnd::Done { .. } => "ok".to_string(),
                            StreamEnd::Cancelled { .. } => "cancelled".to_string(),
                        },
                    ),
                    Err(err) => (0, err.kind().to_string()),
                };
                scope.end(count, &outcome);
                let _ = reply.send(result);
            }
            Request::Describe {
                request_id,
                frame,
                prompt,
                params,
                cancel,
                reply,
            } => {
                if disposing {
                    let _ = reply.send(Err(VedaError::Disposed));
                    continue;
                }
                let scope = RequestScope::begin(
                    &shared,
                    &events,
                    trace.as_ref(),
                    workload,
                    request_id,
                );
                let result = session.describe(&frame, &prompt, &params, &cancel);
                note_memory_pressure(&events, &result);
                let tokens = match &result {
                    Ok(completion) => completion.tokens_generated,
                    Err(VedaError::Cancelled { tokens_generated }) => *tokens_generated,
                    Err(_) => 0,
                };
                scope.end(tokens, &outcome_of(&result));
                let _ = reply.send(result);
            }
            Request::Reset { reply } => {
                if disposing {
                    let _ = reply.send(Err(VedaError::Disposed));
                    continue;
                }
                debug!("resetting engine context");
                let _ = reply.send(session.reset_context());
            }
            Request::Dispose { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }

    // Free the engine handle on this thread, then park the state machine.
    drop(session);
    shared.store_state(STATE_DISPOSED);
}

fn note_memory_pressure<T>(
    events: &broadcast::Sender<WorkerEvent>,
    result: &Result<T, VedaError>,
) {
    if let Err(VedaError::OutOfMemory(detail)) = result {
        warn!(detail = %detail, "engine reported memory pressure");
        let _ = events.send(WorkerEvent::MemoryPressureHandled {
            detail: detail.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::StopReason;
    use crate::engine::scripted::ScriptedBackend;

    fn text_config() -> EngineConfig {
        EngineConfig::new("/models/test.gguf")
    }

    async fn spawn_worker(backend: &ScriptedBackend) -> WorkerHandle {
        WorkerHandle::spawn_text(Arc::new(backend.clone()), text_config(), None)
            .await
            .expect("spawn")
    }

    #[tokio::test]
    async fn generate_round_trip() {
        let backend = ScriptedBackend::new();
        backend.push_reply("hello from the engine");
        let worker = spawn_worker(&backend).await;
        assert_eq!(worker.state(), WorkerState::Ready);

        let completion = worker
            .generate("hi", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(completion.text, "hello from the engine");
        assert_eq!(completion.tokens_generated, 4);
        assert_eq!(worker.state(), WorkerState::Ready);
        worker.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn second_request_is_refused_while_generating() {
        let backend = ScriptedBackend::new().with_token_delay(Duration::from_millis(10));
        backend.push_reply(&"word ".repeat(50));
        let worker = spawn_worker(&backend).await;

        let busy_worker = worker.clone();
        let long_running = tokio::spawn(async move {
            busy_worker
                .generate("slow", &GenerationParams::default())
                .await
        });

        // Give the first request time to reach the engine.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = worker
            .generate("eager", &GenerationParams::default())
            .await
            .unwrap_err();
        assert_eq!(err, VedaError::Busy);

        assert!(long_running.await.unwrap().is_ok());
        worker.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn stream_delivers_tokens_then_outcome() {
        let backend = ScriptedBackend::new();
        backend.push_reply("a b c");
        let worker = spawn_worker(&backend).await;

        let mut stream = worker
            .stream("hi", &GenerationParams::default())
            .await
            .unwrap();
        let mut collected = String::new();
        while let Some(token) = stream.next_token().await {
            collected.push_str(&token);
        }
        assert_eq!(collected, "a b c");
        let end = stream.finish().await.unwrap();
        assert_eq!(
            end,
            StreamEnd::Done {
                reason: StopReason::EndOfSequence,
                tokens_generated: 3,
            }
        );
        worker.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_mid_stream_returns_partial_count_and_ready_state() {
        let backend = ScriptedBackend::new().with_token_delay(Duration::from_millis(5));
        backend.push_reply(&"tok ".repeat(200));
        let worker = spawn_worker(&backend).await;

        let params = GenerationParams {
            max_tokens: 200,
            ..GenerationParams::default()
        };
        let mut stream = worker.stream("go", &params).await.unwrap();
        let mut seen: u32 = 0;
        while let Some(_token) = stream.next_token().await {
            seen += 1;
            if seen == 10 {
                worker.cancel();
            }
        }
        let end = stream.finish().await.unwrap();
        match end {
            StreamEnd::Cancelled { tokens_generated } => assert!(tokens_generated >= 10),
            other => unreachable!("expected cancellation, got {other:?}"),
        }

        // The worker is reusable after a cancelled stream.
        assert_eq!(worker.state(), WorkerState::Ready);
        backend.push_reply("still alive");
        let completion = worker
            .generate("again", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(completion.text, "still alive");
        worker.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn mid_stream_engine_error_returns_worker_to_ready() {
        let backend = ScriptedBackend::new();
        backend.push_fail_after("a b c d e", 2, VedaError::Generation("engine fault".into()));
        let worker = spawn_worker(&backend).await;

        let mut stream = worker
            .stream("go", &GenerationParams::default())
            .await
            .unwrap();
        while stream.next_token().await.is_some() {}
        let err = stream.finish().await.unwrap_err();
        assert!(matches!(err, VedaError::Generation(_)));

        assert_eq!(worker.state(), WorkerState::Ready);
        worker.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn model_load_failure_is_fatal() {
        let backend = ScriptedBackend::new();
        backend.fail_next_load(VedaError::ModelLoad("missing tensor".into()));
        let err = WorkerHandle::spawn_text(Arc::new(backend), text_config(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VedaError::ModelLoad(_)));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_final() {
        let backend = ScriptedBackend::new();
        let worker = spawn_worker(&backend).await;
        worker.dispose().await.unwrap();
        worker.dispose().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Disposed);

        let err = worker
            .generate("hi", &GenerationParams::default())
            .await
            .unwrap_err();
        assert_eq!(err, VedaError::Disposed);
    }

    #[tokio::test]
    async fn describe_requires_vision_worker() {
        let backend = ScriptedBackend::new();
        let worker = spawn_worker(&backend).await;
        let frame = Frame::new(vec![0; 12], 2, 2, 0).unwrap();
        let err = worker
            .describe_image(frame, "what", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VedaError::Config(_)));
        worker.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn vision_worker_describes_frames() {
        let backend = ScriptedBackend::new();
        backend.push_reply("a small test pattern");
        let worker = WorkerHandle::spawn_vision(
            Arc::new(backend),
            VisionConfig::new("/models/vlm.gguf", "/models/proj.gguf"),
            None,
        )
        .await
        .unwrap();
        let frame = Frame::new(vec![0; 27], 3, 3, 0).unwrap();
        let completion = worker
            .describe_image(frame, "describe", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(completion.text, "a small test pattern");
        worker.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn events_and_trace_cover_the_request_lifecycle() {
        let backend = ScriptedBackend::new();
        backend.push_reply("x y");
        let trace = PerfTrace::in_memory();
        let worker = WorkerHandle::spawn_text(
            Arc::new(backend),
            text_config(),
            Some(trace.clone()),
        )
        .await
        .unwrap();
        let mut events = worker.subscribe();

        worker
            .generate("hi", &GenerationParams::default())
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            WorkerEvent::GenerationStarted { .. }
        ));
        match events.recv().await.unwrap() {
            WorkerEvent::GenerationCompleted {
                tokens_generated,
                outcome,
                ..
            } => {
                assert_eq!(tokens_generated, 2);
                assert_eq!(outcome, "ok");
            }
            other => unreachable!("unexpected event {other:?}"),
        }

        let starts = trace.events_where(|b| matches!(b, TraceEventBody::InferenceStart { .. }));
        let ends = trace.events_where(|b| matches!(b, TraceEventBody::InferenceEnd { .. }));
        assert_eq!(starts.len(), 1);
        assert_eq!(ends.len(), 1);
        worker.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn reset_keeps_the_model_loaded() {
        let backend = ScriptedBackend::new();
        let worker = spawn_worker(&backend).await;
        worker.reset().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Ready);
        worker.dispose().await.unwrap();
    }
}
