#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Supervised on-device AI runtime.
//!
//! Hosts large language and vision-language models behind persistent
//! workers and keeps them responsive under real-device pressure: thermal
//! throttling, memory ceilings, battery drain, long sessions. The inference
//! engine itself is an external collaborator reached through the
//! [`engine::EngineBackend`] seam; the FFI-backed implementation lives
//! behind the `native-engine` feature, and [`engine::scripted`] provides a
//! deterministic offline backend for development and tests.
//!
//! The composition root is [`EdgeVeda`]: workers on dedicated OS threads,
//! telemetry polling, hysteresis-gated QoS, declarative compute budgets
//! with adaptive calibration, and a JSONL performance trace.

pub mod budget;
pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod monitor;
pub mod policy;
pub mod scheduler;
pub mod telemetry;
pub mod trace;
pub mod veda;
pub mod worker;

pub use budget::{Budget, BudgetConstraint, BudgetProfile, MeasuredBaseline, resolve, validate};
pub use chat::{ChatConfig, ChatMessage, ChatSession, ChatStream, Role};
pub use chat::template::{ChatTemplate, SystemPromptPreset};
pub use config::{EngineConfig, GenerationParams, VisionConfig};
pub use engine::{
    CancelToken, Completion, EngineBackend, EngineSession, StopReason, StreamEnd,
};
pub use error::VedaError;
pub use frame::{Frame, FrameQueue, PixelFormat};
pub use monitor::{
    BatteryDrainTracker, LatencyObservation, LatencyTracker, MemoryStats, ResourceMonitor,
    ThermalMonitor,
};
pub use policy::{PolicyConfig, QoSChange, QoSLevel, QosOverrides, RuntimePolicy};
pub use scheduler::{
    BudgetViolation, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerSnapshot,
    SchedulerState, WorkloadId, WorkloadPriority,
};
pub use telemetry::{
    BatteryState, ManualPressureSource, PlatformPressureSource, PressureSource, Telemetry,
    TelemetryConfig, TelemetrySample, ThermalLevel,
};
pub use trace::{PerfTrace, TraceConfig, TraceEvent, TraceEventBody};
pub use veda::{BudgetSpec, EdgeVeda, GenerateStream, Response, VedaConfig};
pub use worker::{
    StreamingGeneration, WorkerEvent, WorkerHandle, WorkerKind, WorkerState,
};
