//! The public orchestrator: one type composing workers, telemetry, monitors,
//! policy, scheduler, and trace.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::budget::{Budget, BudgetProfile, validate};
use crate::config::{EngineConfig, GenerationParams, VisionConfig};
use crate::engine::{EngineBackend, StreamEnd};
use crate::error::VedaError;
use crate::frame::{Frame, FrameQueue};
use crate::monitor::{
    BatteryDrainTracker, LatencyObservation, LatencyTracker, MemoryStats, ResourceMonitor,
    ThermalMonitor,
};
use crate::policy::{PolicyConfig, QoSChange, QoSLevel, QosOverrides, RuntimePolicy};
use crate::scheduler::{
    BudgetViolation, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerSnapshot, TickMetrics,
    WorkloadId, WorkloadPriority,
};
use crate::telemetry::{
    PlatformPressureSource, PressureSource, Telemetry, TelemetryConfig, now_ms,
};
use crate::trace::{PerfTrace, TraceConfig, TraceEventBody};
use crate::worker::{StreamingGeneration, WorkerHandle};

/// Orchestrator configuration; every field has a sensible default.
#[derive(Debug, Clone, Default)]
pub struct VedaConfig {
    /// Telemetry polling.
    pub telemetry: TelemetryConfig,
    /// QoS policy thresholds and cooldown.
    pub policy: PolicyConfig,
    /// Scheduler timing.
    pub scheduler: SchedulerConfig,
    /// Trace buffering and sink.
    pub trace: TraceConfig,
    /// Mirror every Nth telemetry sample into the trace; 0 disables.
    pub telemetry_trace_stride: usize,
}

/// Budget input for [`EdgeVeda::set_budget`].
#[derive(Debug, Clone)]
pub enum BudgetSpec {
    /// A concrete budget; enforcement starts immediately.
    Static(Budget),
    /// An adaptive profile; enforcement starts after calibration.
    Adaptive(BudgetProfile),
}

/// Completed generation, as surfaced by the public API.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Generated text.
    pub text: String,
    /// Tokens produced.
    pub tokens_generated: u32,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Tokens per second over the request.
    pub tokens_per_sec: f64,
}

#[derive(Debug)]
pub(crate) struct Monitors {
    pub(crate) latency: LatencyTracker,
    pub(crate) resource: ResourceMonitor,
    pub(crate) thermal: ThermalMonitor,
    pub(crate) drain: BatteryDrainTracker,
}

impl Monitors {
    fn new() -> Self {
        Self {
            latency: LatencyTracker::default(),
            resource: ResourceMonitor::default(),
            thermal: ThermalMonitor::new(),
            drain: BatteryDrainTracker::default(),
        }
    }
}

/// Supervised on-device AI runtime.
///
/// Single-instance-per-process by convention; additional instances are legal
/// and fully isolated (own workers, own engine handles, own telemetry).
pub struct EdgeVeda {
    backend: Arc<dyn EngineBackend>,
    trace: PerfTrace,
    telemetry: Telemetry,
    monitors: Arc<Mutex<Monitors>>,
    policy: Arc<Mutex<RuntimePolicy>>,
    qos_tx: broadcast::Sender<QoSChange>,
    scheduler: Arc<Mutex<Scheduler>>,
    frame_queue: FrameQueue,
    text: Arc<Mutex<Option<WorkerHandle>>>,
    vision: Arc<Mutex<Option<WorkerHandle>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_observation_id: AtomicU64,
    disposed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl EdgeVeda {
    /// Start the runtime with the platform pressure source.
    ///
    /// Must be called from within a tokio runtime; the telemetry, policy,
    /// and enforcement tasks spawn immediately.
    pub fn start(backend: Arc<dyn EngineBackend>, config: VedaConfig) -> Result<Self, VedaError> {
        Self::start_with_source(backend, config, Box::new(PlatformPressureSource::new()))
    }

    /// Start the runtime with a caller-supplied pressure source.
    pub fn start_with_source(
        backend: Arc<dyn EngineBackend>,
        config: VedaConfig,
        source: Box<dyn PressureSource>,
    ) -> Result<Self, VedaError> {
        let trace = PerfTrace::new(config.trace.clone())
            .map_err(|err| VedaError::Config(format!("trace sink: {err}")))?;
        let telemetry = Telemetry::start(source, config.telemetry.clone());
        let monitors = Arc::new(Mutex::new(Monitors::new()));
        let policy = Arc::new(Mutex::new(RuntimePolicy::new(config.policy.clone())));
        let scheduler = Arc::new(Mutex::new(Scheduler::new(
            config.scheduler.clone(),
            Some(trace.clone()),
        )));
        let (qos_tx, _) = broadcast::channel(64);

        let text: Arc<Mutex<Option<WorkerHandle>>> = Arc::new(Mutex::new(None));
        let vision: Arc<Mutex<Option<WorkerHandle>>> = Arc::new(Mutex::new(None));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(sample_pump(
            telemetry.subscribe(),
            Arc::clone(&monitors),
            Arc::clone(&policy),
            qos_tx.clone(),
            trace.clone(),
            config.telemetry_trace_stride,
        )));
        tasks.push(tokio::spawn(enforcement_loop(
            Arc::clone(&scheduler),
            Arc::clone(&monitors),
        )));
        tasks.push(tokio::spawn(mitigation_pump(
            lock(&scheduler).subscribe_events(),
            Arc::clone(&text),
            Arc::clone(&vision),
        )));

        Ok(Self {
            backend,
            frame_queue: FrameQueue::with_trace(trace.clone()),
            trace,
            telemetry,
            monitors,
            policy,
            qos_tx,
            scheduler,
            text,
            vision,
            tasks: Mutex::new(tasks),
            next_observation_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> Result<(), VedaError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(VedaError::Disposed);
        }
        Ok(())
    }

    /// Load the text model and register the `Text` workload.
    pub async fn init_text(&self, config: EngineConfig) -> Result<(), VedaError> {
        self.ensure_live()?;
        if lock(&self.text).is_some() {
            return Err(VedaError::Config("text model already initialized".into()));
        }
        let worker = WorkerHandle::spawn_text(
            Arc::clone(&self.backend),
            config,
            Some(self.trace.clone()),
        )
        .await?;
        *lock(&self.text) = Some(worker);
        lock(&self.scheduler).register(WorkloadId::Text, WorkloadPriority::Normal);
        Ok(())
    }

    /// Load the vision model and register the `Vision` workload.
    pub async fn init_vision(&self, config: VisionConfig) -> Result<(), VedaError> {
        self.ensure_live()?;
        if lock(&self.vision).is_some() {
            return Err(VedaError::Config("vision model already initialized".into()));
        }
        let worker = WorkerHandle::spawn_vision(
            Arc::clone(&self.backend),
            config,
            Some(self.trace.clone()),
        )
        .await?;
        *lock(&self.vision) = Some(worker);
        lock(&self.scheduler).register(WorkloadId::Vision, WorkloadPriority::Normal);
        Ok(())
    }

    fn text_worker(&self) -> Result<WorkerHandle, VedaError> {
        lock(&self.text)
            .clone()
            .ok_or_else(|| VedaError::Config("text model not initialized".into()))
    }

    fn vision_worker(&self) -> Result<WorkerHandle, VedaError> {
        lock(&self.vision)
            .clone()
            .ok_or_else(|| VedaError::Config("vision model not initialized".into()))
    }

    /// Effective QoS for a workload: the policy level advanced by any
    /// scheduler degradation steps.
    fn effective_level(&self, workload: WorkloadId) -> QoSLevel {
        let mut level = lock(&self.policy).level();
        let steps = lock(&self.scheduler).degrade_steps(workload);
        for _ in 0..steps {
            level = level.degraded();
        }
        level
    }

    fn admit(&self, workload: WorkloadId) -> Result<(), VedaError> {
        if !lock(&self.scheduler).admission_open(workload) {
            return Err(VedaError::PolicyRejected(format!(
                "{workload:?} admission gate is closed this interval"
            )));
        }
        lock(&self.scheduler).note_activity(workload, now_ms());
        Ok(())
    }

    fn record_latency(&self, started_at_ms: i64, latency_ms: u64, tokens_generated: u32) {
        let observation = LatencyObservation {
            request_id: self.next_observation_id.fetch_add(1, Ordering::Relaxed),
            started_at_ms,
            completed_at_ms: started_at_ms + latency_ms as i64,
            latency_ms,
            tokens_generated,
        };
        lock(&self.monitors).latency.record(observation);
    }

    /// Run a blocking text generation.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Response, VedaError> {
        self.ensure_live()?;
        params.validate()?;
        let worker = self.text_worker()?;
        self.admit(WorkloadId::Text)?;
        let caps = self.effective_level(WorkloadId::Text).overrides();
        let clamped = params.capped_max_tokens(caps.max_tokens_cap);

        let started_at_ms = now_ms();
        let started = Instant::now();
        let completion = worker.generate(prompt, &clamped).await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.record_latency(started_at_ms, latency_ms, completion.tokens_generated);

        Ok(Response {
            tokens_per_sec: tokens_per_sec(completion.tokens_generated, latency_ms),
            text: completion.text,
            tokens_generated: completion.tokens_generated,
            latency_ms,
        })
    }

    /// Start a streaming text generation.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerateStream, VedaError> {
        self.ensure_live()?;
        params.validate()?;
        let worker = self.text_worker()?;
        self.admit(WorkloadId::Text)?;
        let caps = self.effective_level(WorkloadId::Text).overrides();
        let clamped = params.capped_max_tokens(caps.max_tokens_cap);

        let started_at_ms = now_ms();
        let inner = worker.stream(prompt, &clamped).await?;
        Ok(GenerateStream {
            inner,
            monitors: Arc::clone(&self.monitors),
            next_observation_id: self
                .next_observation_id
                .fetch_add(1, Ordering::Relaxed),
            started_at_ms,
            started: Instant::now(),
        })
    }

    /// Describe an RGB8 frame with the vision model.
    ///
    /// Refused with [`VedaError::PolicyRejected`] while vision is paused by
    /// QoS or scheduler degradation.
    pub async fn describe_image(
        &self,
        frame: Frame,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Response, VedaError> {
        self.ensure_live()?;
        params.validate()?;
        let worker = self.vision_worker()?;
        let level = self.effective_level(WorkloadId::Vision);
        let caps = level.overrides();
        if !caps.vision_allowed {
            return Err(VedaError::PolicyRejected(format!(
                "vision is paused at QoS level {level:?}"
            )));
        }
        self.admit(WorkloadId::Vision)?;
        if let Some(max_side) = caps.vision_max_side_px {
            if frame.max_side() > max_side {
                warn!(
                    frame_side = frame.max_side(),
                    max_side, "frame exceeds the QoS side cap; capture should downscale"
                );
            }
        }
        let clamped = params.capped_max_tokens(caps.max_tokens_cap);

        let started_at_ms = now_ms();
        let started = Instant::now();
        let completion = worker.describe_image(frame, prompt, &clamped).await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.record_latency(started_at_ms, latency_ms, completion.tokens_generated);

        Ok(Response {
            tokens_per_sec: tokens_per_sec(completion.tokens_generated, latency_ms),
            text: completion.text,
            tokens_generated: completion.tokens_generated,
            latency_ms,
        })
    }

    /// Dequeue the pending camera frame (if any) and describe it.
    ///
    /// The in-flight slot is released whatever the outcome, so the capture
    /// side can keep enqueueing at its own cadence. Returns `Ok(None)` when
    /// nothing is pending or a frame is already being processed.
    pub async fn describe_next_frame(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Option<Response>, VedaError> {
        self.ensure_live()?;
        let Some(frame) = self.frame_queue.dequeue() else {
            return Ok(None);
        };
        let result = self.describe_image(frame, prompt, params).await;
        self.frame_queue.mark_done();
        result.map(Some)
    }

    /// Cancel the in-flight request of a workload's worker, if any.
    pub fn cancel(&self, workload: WorkloadId) {
        let worker = match workload {
            WorkloadId::Text => lock(&self.text).clone(),
            WorkloadId::Vision => lock(&self.vision).clone(),
            WorkloadId::Stt => None,
        };
        if let Some(worker) = worker {
            worker.cancel();
        }
    }

    /// The frame queue feeding the vision worker.
    #[must_use]
    pub fn frame_queue(&self) -> &FrameQueue {
        &self.frame_queue
    }

    /// Current memory statistics.
    #[must_use]
    pub fn memory_stats(&self) -> MemoryStats {
        lock(&self.monitors).resource.stats()
    }

    /// Active QoS level (policy only, before per-workload degradation).
    #[must_use]
    pub fn qos_level(&self) -> QoSLevel {
        lock(&self.policy).level()
    }

    /// Caps the capture layer should apply to the vision feed right now.
    #[must_use]
    pub fn vision_caps(&self) -> QosOverrides {
        self.effective_level(WorkloadId::Vision).overrides()
    }

    /// Register (or re-prioritize) a workload with the scheduler.
    pub fn register_workload(&self, id: WorkloadId, priority: WorkloadPriority) {
        lock(&self.scheduler).register(id, priority);
    }

    /// Set the active budget. Returns advisory warnings for static budgets.
    pub fn set_budget(&self, spec: BudgetSpec) -> Vec<String> {
        let mut scheduler = lock(&self.scheduler);
        match spec {
            BudgetSpec::Static(budget) => {
                let warnings = validate(&budget);
                for warning in &warnings {
                    warn!(warning = %warning, "budget validation");
                }
                scheduler.set_static_budget(budget);
                warnings
            }
            BudgetSpec::Adaptive(profile) => {
                scheduler.set_profile(profile);
                Vec::new()
            }
        }
    }

    /// Scheduler state snapshot.
    #[must_use]
    pub fn scheduler_snapshot(&self) -> SchedulerSnapshot {
        lock(&self.scheduler).snapshot()
    }

    /// Subscribe to budget violations.
    #[must_use]
    pub fn on_budget_violation(&self) -> broadcast::Receiver<BudgetViolation> {
        lock(&self.scheduler).subscribe_violations()
    }

    /// Subscribe to the full scheduler event stream.
    #[must_use]
    pub fn on_scheduler_event(&self) -> broadcast::Receiver<SchedulerEvent> {
        lock(&self.scheduler).subscribe_events()
    }

    /// Subscribe to QoS transitions.
    #[must_use]
    pub fn on_qos_change(&self) -> broadcast::Receiver<QoSChange> {
        self.qos_tx.subscribe()
    }

    /// The performance trace.
    #[must_use]
    pub fn trace(&self) -> &PerfTrace {
        &self.trace
    }

    /// Engine version string.
    #[must_use]
    pub fn engine_version(&self) -> String {
        self.backend.version()
    }

    /// Stop everything: cancel in-flight work, dispose workers, stop
    /// telemetry and background tasks, flush the trace. Idempotent.
    pub async fn dispose(&self) -> Result<(), VedaError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("disposing runtime");

        let text = lock(&self.text).take();
        let vision = lock(&self.vision).take();
        if let Some(worker) = text {
            worker.cancel();
            let _ = worker.dispose().await;
        }
        if let Some(worker) = vision {
            worker.cancel();
            let _ = worker.dispose().await;
        }

        self.telemetry.stop();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.trace.flush();
        Ok(())
    }
}

fn tokens_per_sec(tokens: u32, latency_ms: u64) -> f64 {
    if latency_ms == 0 {
        f64::from(tokens) * 1000.0
    } else {
        f64::from(tokens) * 1000.0 / latency_ms as f64
    }
}

/// A streaming response bound to the runtime's monitors.
#[derive(Debug)]
pub struct GenerateStream {
    inner: StreamingGeneration,
    monitors: Arc<Mutex<Monitors>>,
    next_observation_id: u64,
    started_at_ms: i64,
    started: Instant,
}

impl GenerateStream {
    /// Next token, or `None` once the stream has ended.
    pub async fn next_token(&mut self) -> Option<String> {
        self.inner.next_token().await
    }

    /// Await the terminal outcome, recording latency on completion.
    pub async fn finish(self) -> Result<StreamEnd, VedaError> {
        let end = self.inner.finish().await?;
        if let StreamEnd::Done {
            tokens_generated, ..
        } = end
        {
            let latency_ms = self.started.elapsed().as_millis() as u64;
            lock(&self.monitors).latency.record(LatencyObservation {
                request_id: self.next_observation_id,
                started_at_ms: self.started_at_ms,
                completed_at_ms: self.started_at_ms + latency_ms as i64,
                latency_ms,
                tokens_generated,
            });
        }
        Ok(end)
    }
}

/// Feeds telemetry samples into the monitors, the QoS policy, and (on a
/// stride) the trace.
async fn sample_pump(
    mut samples: broadcast::Receiver<crate::telemetry::TelemetrySample>,
    monitors: Arc<Mutex<Monitors>>,
    policy: Arc<Mutex<RuntimePolicy>>,
    qos_tx: broadcast::Sender<QoSChange>,
    trace: PerfTrace,
    trace_stride: usize,
) {
    let mut seen: usize = 0;
    loop {
        let sample = match samples.recv().await {
            Ok(sample) => sample,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "sample pump lagged; continuing");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        {
            let mut monitors = lock(&monitors);
            monitors.drain.observe(&sample);
            monitors.thermal.observe(sample.thermal);
            monitors
                .resource
                .record(sample.rss_bytes, sample.available_bytes);
        }

        if let Some(change) = lock(&policy).observe(&sample) {
            trace.emit_at(
                change.at_ms,
                TraceEventBody::QosChange {
                    from: change.from,
                    to: change.to,
                    reason: change.reason.clone(),
                },
                None,
            );
            let _ = qos_tx.send(change);
        }

        seen += 1;
        if trace_stride > 0 && seen % trace_stride == 0 {
            trace.emit_at(
                sample.timestamp_ms,
                TraceEventBody::TelemetrySample {
                    thermal: sample.thermal,
                    rss_bytes: sample.rss_bytes,
                    available_bytes: sample.available_bytes,
                },
                None,
            );
        }
    }
}

/// Cancels a workload's in-flight request when the scheduler escalates past
/// one-step degradation and closes its admission gate.
async fn mitigation_pump(
    mut events: broadcast::Receiver<SchedulerEvent>,
    text: Arc<Mutex<Option<WorkerHandle>>>,
    vision: Arc<Mutex<Option<WorkerHandle>>>,
) {
    loop {
        match events.recv().await {
            Ok(SchedulerEvent::AdmissionClosed { id }) => {
                let worker = match id {
                    WorkloadId::Text => lock(&text).clone(),
                    WorkloadId::Vision => lock(&vision).clone(),
                    WorkloadId::Stt => None,
                };
                if let Some(worker) = worker {
                    debug!(?id, "admission gate closed; cancelling in-flight work");
                    worker.cancel();
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Drives the scheduler on its enforcement interval. Errors (a poisoned
/// lock, a missing metric) degrade to a skipped tick, never an abort.
async fn enforcement_loop(scheduler: Arc<Mutex<Scheduler>>, monitors: Arc<Mutex<Monitors>>) {
    let interval = lock(&scheduler).enforcement_interval();
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;

        let metrics = {
            let monitors = lock(&monitors);
            TickMetrics {
                now_ms: now_ms(),
                p95_ms: monitors.latency.p95(),
                drain_per_10min: monitors.drain.drain_per_10min(),
                thermal: monitors.thermal.level(),
                rss_mb: monitors.resource.current() / (1024 * 1024),
                latency_warm: monitors.latency.is_warm(),
                latency_count: monitors.latency.count(),
            }
        };
        let violations = lock(&scheduler).tick(&metrics);
        if !violations.is_empty() {
            debug!(count = violations.len(), "budget violations this tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::scripted::ScriptedBackend;
    use crate::telemetry::{ManualPressureSource, TelemetrySample, ThermalLevel};

    fn fast_config() -> VedaConfig {
        VedaConfig {
            telemetry: TelemetryConfig {
                poll_interval: Duration::from_millis(5),
                channel_capacity: 256,
            },
            telemetry_trace_stride: 1,
            ..VedaConfig::default()
        }
    }

    async fn runtime_with_source(
        backend: &ScriptedBackend,
        source: ManualPressureSource,
    ) -> EdgeVeda {
        let veda = EdgeVeda::start_with_source(
            Arc::new(backend.clone()),
            fast_config(),
            Box::new(source),
        )
        .unwrap();
        veda.init_text(EngineConfig::new("/models/test.gguf"))
            .await
            .unwrap();
        veda
    }

    #[tokio::test]
    async fn generate_applies_qos_token_caps() {
        let backend = ScriptedBackend::new();
        backend.push_reply(&"word ".repeat(150));
        let veda = runtime_with_source(&backend, ManualPressureSource::new()).await;

        let params = GenerationParams {
            max_tokens: 200,
            ..GenerationParams::default()
        };
        let response = veda.generate("hi", &params).await.unwrap();
        // Full-level cap is 100 tokens even though the caller asked for 200.
        assert_eq!(response.tokens_generated, 100);
        veda.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn thermal_spike_pauses_vision() {
        let backend = ScriptedBackend::new();
        let source = ManualPressureSource::new();
        let veda = runtime_with_source(&backend, source.clone()).await;
        veda.init_vision(VisionConfig::new("/m/vlm.gguf", "/m/proj.gguf"))
            .await
            .unwrap();
        let mut qos = veda.on_qos_change();

        let mut sample = TelemetrySample::nominal(now_ms());
        sample.thermal = ThermalLevel::Critical;
        source.push(sample);

        let change = tokio::time::timeout(Duration::from_secs(2), qos.recv())
            .await
            .expect("qos change within deadline")
            .unwrap();
        assert_eq!(change.to, QoSLevel::Paused);

        let frame = Frame::new(vec![0; 12], 2, 2, 0).unwrap();
        let err = veda
            .describe_image(frame, "what", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VedaError::PolicyRejected(_)));

        // Text still runs while paused, at the minimal token cap.
        backend.push_reply(&"word ".repeat(80));
        let response = veda
            .generate("still here?", &GenerationParams::default())
            .await
            .unwrap();
        assert!(response.tokens_generated <= 50);
        veda.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn memory_stats_follow_telemetry() {
        let backend = ScriptedBackend::new();
        let source = ManualPressureSource::new();
        let mut sample = TelemetrySample::nominal(now_ms());
        sample.rss_bytes = 123 * 1024 * 1024;
        sample.available_bytes = 500 * 1024 * 1024;
        source.push(sample);
        let veda = runtime_with_source(&backend, source).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if veda.memory_stats().current_rss_bytes > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stats populated");

        let stats = veda.memory_stats();
        assert_eq!(stats.current_rss_bytes, 123 * 1024 * 1024);
        assert_eq!(stats.available_bytes, 500 * 1024 * 1024);
        veda.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_blocks_requests() {
        let backend = ScriptedBackend::new();
        let veda = runtime_with_source(&backend, ManualPressureSource::new()).await;
        veda.dispose().await.unwrap();
        veda.dispose().await.unwrap();
        let err = veda
            .generate("hi", &GenerationParams::default())
            .await
            .unwrap_err();
        assert_eq!(err, VedaError::Disposed);
    }

    #[tokio::test]
    async fn static_budget_warnings_surface() {
        let backend = ScriptedBackend::new();
        let veda = runtime_with_source(&backend, ManualPressureSource::new()).await;
        let warnings = veda.set_budget(BudgetSpec::Static(Budget {
            p95_latency_ms: Some(10.0),
            memory_ceiling_mb: Some(256),
            ..Budget::default()
        }));
        assert_eq!(warnings.len(), 2);
        veda.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn describe_next_frame_drains_the_queue() {
        let backend = ScriptedBackend::new();
        let veda = runtime_with_source(&backend, ManualPressureSource::new()).await;
        veda.init_vision(VisionConfig::new("/m/vlm.gguf", "/m/proj.gguf"))
            .await
            .unwrap();

        assert_eq!(
            veda.describe_next_frame("what", &GenerationParams::default())
                .await
                .unwrap(),
            None,
            "empty queue yields nothing"
        );

        backend.push_reply("a test pattern");
        veda.frame_queue()
            .enqueue(Frame::new(vec![0; 12], 2, 2, 1).unwrap());
        let response = veda
            .describe_next_frame("what", &GenerationParams::default())
            .await
            .unwrap()
            .expect("a described frame");
        assert_eq!(response.text, "a test pattern");
        assert!(!veda.frame_queue().has_pending());
        assert!(!veda.frame_queue().in_flight(), "slot released");
        veda.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn double_init_is_rejected() {
        let backend = ScriptedBackend::new();
        let veda = runtime_with_source(&backend, ManualPressureSource::new()).await;
        let err = veda
            .init_text(EngineConfig::new("/models/other.gguf"))
            .await
            .unwrap_err();
        assert!(matches!(err, VedaError::Config(_)));
        veda.dispose().await.unwrap();
    }
}
