//! Structured performance trace: bounded in-memory ring plus an optional
//! JSONL file sink.
//!
//! The event schema is fixed at the type level; a kind outside
//! [`TraceEventBody`] cannot be constructed or parsed. Tracing must never
//! break the hot path: sink write failures are logged once per rotation and
//! the events are dropped.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::budget::BudgetConstraint;
use crate::policy::QoSLevel;
use crate::scheduler::WorkloadId;
use crate::telemetry::{ThermalLevel, now_ms};

/// One trace record. Serializes to a single flat JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Event time, unix milliseconds.
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    /// Originating workload, when one applies.
    #[serde(rename = "w", default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadId>,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub body: TraceEventBody,
}

/// Kind-tagged event payloads. The tag set is closed; unknown kinds fail to
/// parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventBody {
    /// A generation request entered the engine.
    InferenceStart {
        /// Request identifier.
        request_id: u64,
    },
    /// A generation request left the engine.
    InferenceEnd {
        /// Request identifier.
        request_id: u64,
        /// End-to-end latency in milliseconds.
        latency_ms: u64,
        /// Tokens produced.
        tokens: u32,
        /// Machine-readable outcome kind (`ok`, `cancelled`, ...).
        outcome: String,
    },
    /// The runtime policy changed QoS level.
    QosChange {
        /// Level before.
        from: QoSLevel,
        /// Level after.
        to: QoSLevel,
        /// Trigger or cooldown description.
        reason: String,
    },
    /// The frame queue displaced a pending frame.
    FrameDrop {
        /// Monotonic total of dropped frames.
        dropped_total: u64,
    },
    /// The scheduler detected a budget violation.
    BudgetViolation {
        /// Violated dimension.
        constraint: BudgetConstraint,
        /// Metric value at detection.
        current_value: f64,
        /// Budgeted ceiling.
        budget_value: f64,
        /// Whether a mitigation was applied.
        mitigated: bool,
        /// Whether the dimension is observe-only.
        observe_only: bool,
    },
    /// The scheduler froze a baseline and resolved a budget.
    BaselineUpdated {
        /// Measured p95 in milliseconds.
        p95_ms: f64,
        /// Measured drain in percent per 10 minutes.
        drain_per_10min: f64,
        /// Thermal level at measurement.
        thermal: ThermalLevel,
        /// RSS at measurement, megabytes.
        rss_mb: u64,
    },
    /// A mirrored telemetry sample.
    TelemetrySample {
        /// Thermal level.
        thermal: ThermalLevel,
        /// Process RSS in bytes.
        rss_bytes: u64,
        /// Available memory in bytes.
        available_bytes: u64,
    },
}

/// Trace buffering and sink configuration.
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    /// Ring capacity; oldest events are evicted past it. 0 means default.
    pub capacity: usize,
    /// JSONL sink path; `None` keeps the trace in memory only.
    pub sink_path: Option<PathBuf>,
    /// Lines buffered between flushes (a "rotation"). 0 means default.
    pub flush_every: usize,
}

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_FLUSH_EVERY: usize = 64;

struct SinkState {
    writer: BufWriter<File>,
    buffered: usize,
    failure_logged: bool,
}

struct TraceInner {
    ring: VecDeque<TraceEvent>,
    capacity: usize,
    flush_every: usize,
    sink: Option<SinkState>,
}

/// Bounded structured event recorder. Cheap to clone; clones share the ring
/// and sink.
#[derive(Clone)]
pub struct PerfTrace {
    inner: Arc<Mutex<TraceInner>>,
}

impl std::fmt::Debug for PerfTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PerfTrace")
            .field("events", &inner.ring.len())
            .field("capacity", &inner.capacity)
            .field("has_sink", &inner.sink.is_some())
            .finish()
    }
}

impl Default for PerfTrace {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PerfTrace {
    /// Create a trace from config, opening the sink file if one is set.
    pub fn new(config: TraceConfig) -> std::io::Result<Self> {
        let sink = match &config.sink_path {
            Some(path) => {
                let file = File::create(path)?;
                Some(SinkState {
                    writer: BufWriter::new(file),
                    buffered: 0,
                    failure_logged: false,
                })
            }
            None => None,
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(TraceInner {
                ring: VecDeque::new(),
                capacity: if config.capacity == 0 {
                    DEFAULT_CAPACITY
                } else {
                    config.capacity
                },
                flush_every: if config.flush_every == 0 {
                    DEFAULT_FLUSH_EVERY
                } else {
                    config.flush_every
                },
                sink,
            })),
        })
    }

    /// Create an in-memory trace with default capacity.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(TraceConfig::default()).expect("in-memory trace cannot fail")
    }

    /// Record an event stamped with the current wall clock.
    pub fn emit(&self, body: TraceEventBody, workload: Option<WorkloadId>) {
        self.emit_at(now_ms(), body, workload);
    }

    /// Record an event with an explicit timestamp.
    pub fn emit_at(&self, timestamp_ms: i64, body: TraceEventBody, workload: Option<WorkloadId>) {
        let event = TraceEvent {
            timestamp_ms,
            workload,
            body,
        };
        let mut inner = self.lock();
        if inner.ring.len() >= inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());
        inner.write_line(&event);
    }

    /// Snapshot of the buffered events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.lock().ring.iter().cloned().collect()
    }

    /// Buffered events matching a predicate on the body.
    #[must_use]
    pub fn events_where(&self, mut pred: impl FnMut(&TraceEventBody) -> bool) -> Vec<TraceEvent> {
        self.lock()
            .ring
            .iter()
            .filter(|e| pred(&e.body))
            .cloned()
            .collect()
    }

    /// Flush the sink, if any.
    pub fn flush(&self) {
        self.lock().flush_sink();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TraceInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TraceInner {
    fn write_line(&mut self, event: &TraceEvent) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                if !sink.failure_logged {
                    warn!(error = %err, "trace serialization failed; dropping events this rotation");
                    sink.failure_logged = true;
                }
                return;
            }
        };
        if let Err(err) = writeln!(sink.writer, "{line}") {
            if !sink.failure_logged {
                warn!(error = %err, "trace sink write failed; dropping events this rotation");
                sink.failure_logged = true;
            }
            return;
        }
        sink.buffered += 1;
        if sink.buffered >= self.flush_every {
            self.flush_sink();
        }
    }

    fn flush_sink(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            match sink.writer.flush() {
                Ok(()) => {
                    sink.buffered = 0;
                    sink.failure_logged = false;
                }
                Err(err) => {
                    if !sink.failure_logged {
                        warn!(error = %err, "trace sink flush failed");
                        sink.failure_logged = true;
                    }
                }
            }
        }
    }
}

impl Drop for TraceInner {
    fn drop(&mut self) {
        self.flush_sink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let trace = PerfTrace::new(TraceConfig {
            capacity: 3,
            ..TraceConfig::default()
        })
        .unwrap();
        for id in 0..5 {
            trace.emit_at(id, TraceEventBody::InferenceStart { request_id: id as u64 }, None);
        }
        let events = trace.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].timestamp_ms, 2);
        assert_eq!(events[2].timestamp_ms, 4);
    }

    #[test]
    fn events_serialize_to_flat_jsonl_objects() {
        let event = TraceEvent {
            timestamp_ms: 1234,
            workload: Some(WorkloadId::Vision),
            body: TraceEventBody::FrameDrop { dropped_total: 7 },
        };
        let line = serde_json::to_string(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["t"], 1234);
        assert_eq!(value["w"], "vision");
        assert_eq!(value["kind"], "frame_drop");
        assert_eq!(value["dropped_total"], 7);
    }

    #[test]
    fn unknown_kinds_fail_to_parse() {
        let line = r#"{"t":1,"kind":"surprise_event","value":3}"#;
        assert!(serde_json::from_str::<TraceEvent>(line).is_err());
    }

    #[test]
    fn known_lines_round_trip() {
        let event = TraceEvent {
            timestamp_ms: 9,
            workload: Some(WorkloadId::Text),
            body: TraceEventBody::BudgetViolation {
                constraint: BudgetConstraint::P95Latency,
                current_value: 2000.0,
                budget_value: 1500.0,
                mitigated: true,
                observe_only: false,
            },
        };
        let line = serde_json::to_string(&event).unwrap();
        let back: TraceEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn sink_writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let trace = PerfTrace::new(TraceConfig {
            capacity: 16,
            sink_path: Some(path.clone()),
            flush_every: 1,
        })
        .unwrap();
        trace.emit_at(1, TraceEventBody::InferenceStart { request_id: 1 }, Some(WorkloadId::Text));
        trace.emit_at(
            2,
            TraceEventBody::InferenceEnd {
                request_id: 1,
                latency_ms: 42,
                tokens: 8,
                outcome: "ok".into(),
            },
            Some(WorkloadId::Text),
        );
        trace.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: TraceEvent = serde_json::from_str(line).unwrap();
            assert!(parsed.timestamp_ms > 0);
        }
    }

    #[test]
    fn events_where_filters_by_kind() {
        let trace = PerfTrace::in_memory();
        trace.emit_at(1, TraceEventBody::InferenceStart { request_id: 1 }, None);
        trace.emit_at(2, TraceEventBody::FrameDrop { dropped_total: 1 }, None);
        trace.emit_at(3, TraceEventBody::InferenceStart { request_id: 2 }, None);
        let starts = trace.events_where(|b| matches!(b, TraceEventBody::InferenceStart { .. }));
        assert_eq!(starts.len(), 2);
    }
}
