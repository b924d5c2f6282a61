//! Central arbiter: workload registry, adaptive calibration, and budget
//! enforcement.
//!
//! The scheduler holds no workload lifetimes; it knows registrations by id
//! and reaches running work only through degradation steps, admission gates,
//! and the cooperative cancel path. Enforcement is a pure state transition
//! over [`TickMetrics`], driven on a timer by the orchestrator; errors in a
//! tick degrade to a no-op for that tick, never an abort.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::budget::{Budget, BudgetConstraint, BudgetProfile, MeasuredBaseline, resolve};
use crate::telemetry::ThermalLevel;
use crate::trace::{PerfTrace, TraceEventBody};

/// Identifier of a registered workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadId {
    /// Text generation requests.
    Text,
    /// Camera frame description requests.
    Vision,
    /// Speech-to-text requests.
    Stt,
}

/// Workload priority; degradation targets the lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPriority {
    /// First to degrade.
    Low,
    /// Default.
    Normal,
    /// Last to degrade; admits ahead of lower priorities.
    High,
}

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// No budget set; no enforcement.
    Idle,
    /// Adaptive profile set; measuring a baseline, not enforcing.
    Calibrating,
    /// Budget resolved; enforcing every interval.
    Enforcing,
}

/// One detected budget violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetViolation {
    /// Violated dimension.
    pub constraint: BudgetConstraint,
    /// Metric value at detection time.
    pub current_value: f64,
    /// Budgeted ceiling.
    pub budget_value: f64,
    /// What the scheduler did about it.
    pub mitigation: String,
    /// Detection time, unix milliseconds.
    pub timestamp_ms: i64,
    /// Whether a mitigation was applied.
    pub mitigated: bool,
    /// Whether this dimension is observe-only (memory).
    pub observe_only: bool,
}

/// Scheduler event stream payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    /// Calibration finished; a budget is now enforced.
    BaselineUpdated {
        /// The frozen baseline.
        baseline: MeasuredBaseline,
        /// The budget resolved from it.
        resolved: Budget,
    },
    /// A violation was detected this tick.
    Violation(BudgetViolation),
    /// A workload was degraded by one step.
    WorkloadDegraded {
        /// Target workload.
        id: WorkloadId,
        /// Its new step count.
        steps: u8,
    },
    /// A previously degraded workload was restored by one step.
    WorkloadRestored {
        /// Target workload.
        id: WorkloadId,
        /// Its new step count.
        steps: u8,
    },
    /// A workload at its degradation floor had its admission gate closed for
    /// one interval; its in-flight request should be cancelled.
    AdmissionClosed {
        /// Target workload.
        id: WorkloadId,
    },
}

/// Registration status of one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// Workload id.
    pub id: WorkloadId,
    /// Priority.
    pub priority: WorkloadPriority,
    /// Degradation steps currently applied.
    pub degrade_steps: u8,
    /// Whether new requests are admitted.
    pub admission_open: bool,
}

/// Cheap scheduler state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Lifecycle state.
    pub state: SchedulerState,
    /// Frozen baseline, once calibrated.
    pub baseline: Option<MeasuredBaseline>,
    /// Active budget, once resolved or set statically.
    pub resolved_budget: Option<Budget>,
    /// Per-workload status.
    pub workloads: Vec<WorkloadStatus>,
}

/// Metrics sampled at the top of one enforcement tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickMetrics {
    /// Tick time, unix milliseconds.
    pub now_ms: i64,
    /// Current p95 latency, when the tracker has data.
    pub p95_ms: Option<f64>,
    /// Current drain rate, when the tracker is warm.
    pub drain_per_10min: Option<f64>,
    /// Current thermal level.
    pub thermal: ThermalLevel,
    /// Current RSS in megabytes.
    pub rss_mb: u64,
    /// Whether the latency tracker is warm.
    pub latency_warm: bool,
    /// Latency observations behind `p95_ms`.
    pub latency_count: usize,
}

/// Enforcement timing configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the enforcement loop evaluates the budget.
    pub enforcement_interval: Duration,
    /// Continuous in-budget time before one degradation step is restored.
    pub recovery_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enforcement_interval: Duration::from_secs(2),
            recovery_window: Duration::from_secs(15),
        }
    }
}

/// Degradation floor: Full -> Reduced -> Minimal -> Paused is three steps.
const MAX_DEGRADE_STEPS: u8 = 3;

#[derive(Debug)]
struct WorkloadEntry {
    id: WorkloadId,
    priority: WorkloadPriority,
    degrade_steps: u8,
    admission_open: bool,
    gate_closed_this_tick: bool,
    last_activity_ms: i64,
}

/// The scheduler core. Synchronous; the orchestrator drives [`Self::tick`]
/// on the enforcement interval.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    profile: Option<BudgetProfile>,
    baseline: Option<MeasuredBaseline>,
    resolved: Option<Budget>,
    workloads: Vec<WorkloadEntry>,
    /// Most-recent degradations, restored LIFO.
    degrade_stack: Vec<WorkloadId>,
    /// Since when every metric has been within budget.
    within_since_ms: Option<i64>,
    events: broadcast::Sender<SchedulerEvent>,
    violations: broadcast::Sender<BudgetViolation>,
    trace: Option<PerfTrace>,
}

impl Scheduler {
    /// Create an idle scheduler.
    #[must_use]
    pub fn new(config: SchedulerConfig, trace: Option<PerfTrace>) -> Self {
        let (events, _) = broadcast::channel(256);
        let (violations, _) = broadcast::channel(256);
        Self {
            config,
            state: SchedulerState::Idle,
            profile: None,
            baseline: None,
            resolved: None,
            workloads: Vec::new(),
            degrade_stack: Vec::new(),
            within_since_ms: None,
            events,
            violations,
            trace,
        }
    }

    /// Enforcement cadence.
    #[must_use]
    pub fn enforcement_interval(&self) -> Duration {
        self.config.enforcement_interval
    }

    /// Register (or re-prioritize) a workload.
    pub fn register(&mut self, id: WorkloadId, priority: WorkloadPriority) {
        if let Some(entry) = self.workloads.iter_mut().find(|w| w.id == id) {
            entry.priority = priority;
            return;
        }
        self.workloads.push(WorkloadEntry {
            id,
            priority,
            degrade_steps: 0,
            admission_open: true,
            gate_closed_this_tick: false,
            last_activity_ms: 0,
        });
    }

    /// Remove a workload registration.
    pub fn unregister(&mut self, id: WorkloadId) {
        self.workloads.retain(|w| w.id != id);
        self.degrade_stack.retain(|w| *w != id);
    }

    /// Record request activity, used to break degradation ties.
    pub fn note_activity(&mut self, id: WorkloadId, now_ms: i64) {
        if let Some(entry) = self.workloads.iter_mut().find(|w| w.id == id) {
            entry.last_activity_ms = now_ms;
        }
    }

    /// Set a static budget: skips calibration, enforces immediately.
    pub fn set_static_budget(&mut self, budget: Budget) {
        self.profile = None;
        self.baseline = None;
        self.resolved = Some(budget);
        self.state = SchedulerState::Enforcing;
        self.within_since_ms = None;
    }

    /// Set an adaptive profile: enters calibration until the monitors warm
    /// up, then resolves and enforces.
    pub fn set_profile(&mut self, profile: BudgetProfile) {
        self.profile = Some(profile);
        self.baseline = None;
        self.resolved = None;
        self.state = SchedulerState::Calibrating;
        self.within_since_ms = None;
    }

    /// Subscribe to the full event stream.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Subscribe to violations only.
    #[must_use]
    pub fn subscribe_violations(&self) -> broadcast::Receiver<BudgetViolation> {
        self.violations.subscribe()
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Degradation steps currently applied to a workload.
    #[must_use]
    pub fn degrade_steps(&self, id: WorkloadId) -> u8 {
        self.workloads
            .iter()
            .find(|w| w.id == id)
            .map_or(0, |w| w.degrade_steps)
    }

    /// Whether new requests for this workload are admitted. Unregistered
    /// workloads are always admitted.
    #[must_use]
    pub fn admission_open(&self, id: WorkloadId) -> bool {
        self.workloads
            .iter()
            .find(|w| w.id == id)
            .is_none_or(|w| w.admission_open)
    }

    /// Current state snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            state: self.state,
            baseline: self.baseline,
            resolved_budget: self.resolved.clone(),
            workloads: self
                .workloads
                .iter()
                .map(|w| WorkloadStatus {
                    id: w.id,
                    priority: w.priority,
                    degrade_steps: w.degrade_steps,
                    admission_open: w.admission_open,
                })
                .collect(),
        }
    }

    /// Run one enforcement tick. Returns the violations detected (already
    /// delivered to subscribers).
    pub fn tick(&mut self, metrics: &TickMetrics) -> Vec<BudgetViolation> {
        match self.state {
            SchedulerState::Idle => Vec::new(),
            SchedulerState::Calibrating => {
                self.try_freeze_baseline(metrics);
                Vec::new()
            }
            SchedulerState::Enforcing => self.enforce(metrics),
        }
    }

    fn try_freeze_baseline(&mut self, metrics: &TickMetrics) {
        let Some(profile) = self.profile else {
            return;
        };
        let (Some(p95), Some(drain)) = (metrics.p95_ms, metrics.drain_per_10min) else {
            return;
        };
        if !metrics.latency_warm {
            return;
        }

        let baseline = MeasuredBaseline {
            measured_p95_ms: p95,
            measured_drain_per_10min: drain,
            current_thermal_level: metrics.thermal,
            current_rss_mb: metrics.rss_mb,
            sample_count: metrics.latency_count,
            measured_at_ms: metrics.now_ms,
        };
        let resolved = resolve(profile, &baseline);
        debug!(?profile, ?resolved, "baseline frozen; entering enforcement");

        self.baseline = Some(baseline);
        self.resolved = Some(resolved.clone());
        self.state = SchedulerState::Enforcing;
        if let Some(trace) = &self.trace {
            trace.emit_at(
                metrics.now_ms,
                TraceEventBody::BaselineUpdated {
                    p95_ms: baseline.measured_p95_ms,
                    drain_per_10min: baseline.measured_drain_per_10min,
                    thermal: baseline.current_thermal_level,
                    rss_mb: baseline.current_rss_mb,
                },
                None,
            );
        }
        let _ = self.events.send(SchedulerEvent::BaselineUpdated { baseline, resolved });
    }

    fn enforce(&mut self, metrics: &TickMetrics) -> Vec<BudgetViolation> {
        let Some(budget) = self.resolved.clone() else {
            return Vec::new();
        };

        // Gates closed on the previous tick reopen at the top of this one:
        // "closed for one interval".
        for entry in &mut self.workloads {
            if !entry.admission_open && !entry.gate_closed_this_tick {
                entry.admission_open = true;
            }
            entry.gate_closed_this_tick = false;
        }

        // Candidate violations, in mitigation priority order.
        let mut candidates: Vec<(BudgetConstraint, f64, f64, bool)> = Vec::new();
        if let (Some(limit), Some(current)) = (budget.p95_latency_ms, metrics.p95_ms) {
            if current > limit {
                candidates.push((BudgetConstraint::P95Latency, current, limit, false));
            }
        }
        if let (Some(limit), Some(current)) =
            (budget.battery_drain_per_10min, metrics.drain_per_10min)
        {
            if current > limit {
                candidates.push((BudgetConstraint::BatteryDrain, current, limit, false));
            }
        }
        if let Some(limit) = budget.max_thermal_level {
            if metrics.thermal > limit {
                candidates.push((
                    BudgetConstraint::Thermal,
                    f64::from(metrics.thermal.as_u8()),
                    f64::from(limit.as_u8()),
                    false,
                ));
            }
        }
        if let Some(limit) = budget.memory_ceiling_mb {
            if metrics.rss_mb > limit {
                // Memory is observe-only: a loaded model cannot shrink.
                candidates.push((
                    BudgetConstraint::MemoryCeiling,
                    metrics.rss_mb as f64,
                    limit as f64,
                    true,
                ));
            }
        }

        let mut violations = Vec::with_capacity(candidates.len());
        for (constraint, current_value, budget_value, observe_only) in candidates {
            let (mitigated, mitigation) = if observe_only {
                (false, "observe-only: model unload is never automatic".to_string())
            } else {
                self.mitigate(metrics.now_ms)
            };
            let violation = BudgetViolation {
                constraint,
                current_value,
                budget_value,
                mitigation,
                timestamp_ms: metrics.now_ms,
                mitigated,
                observe_only,
            };
            if let Some(trace) = &self.trace {
                trace.emit_at(
                    metrics.now_ms,
                    TraceEventBody::BudgetViolation {
                        constraint: violation.constraint,
                        current_value: violation.current_value,
                        budget_value: violation.budget_value,
                        mitigated: violation.mitigated,
                        observe_only: violation.observe_only,
                    },
                    None,
                );
            }
            let _ = self.violations.send(violation.clone());
            let _ = self
                .events
                .send(SchedulerEvent::Violation(violation.clone()));
            violations.push(violation);
        }

        if violations.is_empty() {
            self.recover(metrics.now_ms);
        } else {
            self.within_since_ms = None;
        }

        violations
    }

    /// Degrade the lowest-priority workload by one step, or close its
    /// admission gate when it is already at the floor.
    fn mitigate(&mut self, now_ms: i64) -> (bool, String) {
        let Some(idx) = self.pick_degrade_target() else {
            return (false, "no registered workload to degrade".to_string());
        };
        let entry = &mut self.workloads[idx];
        if entry.degrade_steps < MAX_DEGRADE_STEPS {
            entry.degrade_steps += 1;
            let id = entry.id;
            let steps = entry.degrade_steps;
            self.degrade_stack.push(id);
            let _ = self.events.send(SchedulerEvent::WorkloadDegraded { id, steps });
            debug!(?id, steps, now_ms, "degraded workload by one step");
            (true, format!("degraded {id:?} by one QoS step (now {steps})"))
        } else if entry.admission_open {
            entry.admission_open = false;
            entry.gate_closed_this_tick = true;
            let id = entry.id;
            let _ = self.events.send(SchedulerEvent::AdmissionClosed { id });
            debug!(?id, now_ms, "closed admission gate for one interval");
            (true, format!("closed {id:?} admission gate for one interval"))
        } else {
            (false, "lowest-priority workload already fully degraded".to_string())
        }
    }

    /// Lowest priority first; ties broken by most recent activity.
    fn pick_degrade_target(&self) -> Option<usize> {
        self.workloads
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.last_activity_ms.cmp(&a.last_activity_ms))
            })
            .map(|(idx, _)| idx)
    }

    /// After `recovery_window` fully within budget, restore the most
    /// recently degraded workload by one step.
    fn recover(&mut self, now_ms: i64) {
        let since = *self.within_since_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(since) < self.config.recovery_window.as_millis() as i64 {
            return;
        }
        let Some(id) = self.degrade_stack.pop() else {
            return;
        };
        if let Some(entry) = self.workloads.iter_mut().find(|w| w.id == id) {
            entry.degrade_steps = entry.degrade_steps.saturating_sub(1);
            let steps = entry.degrade_steps;
            let _ = self.events.send(SchedulerEvent::WorkloadRestored { id, steps });
            debug!(?id, steps, "restored workload by one step");
        }
        // One step per recovery window.
        self.within_since_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(now_ms: i64) -> TickMetrics {
        TickMetrics {
            now_ms,
            p95_ms: Some(1000.0),
            drain_per_10min: Some(2.0),
            thermal: ThermalLevel::Nominal,
            rss_mb: 800,
            latency_warm: true,
            latency_count: 25,
        }
    }

    fn enforcing_scheduler() -> Scheduler {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), None);
        scheduler.register(WorkloadId::Text, WorkloadPriority::High);
        scheduler.register(WorkloadId::Vision, WorkloadPriority::Normal);
        scheduler.set_profile(BudgetProfile::Balanced);
        scheduler.tick(&metrics(1_000));
        assert_eq!(scheduler.state(), SchedulerState::Enforcing);
        scheduler
    }

    #[test]
    fn calibration_waits_for_warm_monitors() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), None);
        scheduler.set_profile(BudgetProfile::Balanced);
        assert_eq!(scheduler.state(), SchedulerState::Calibrating);

        let mut cold = metrics(500);
        cold.latency_warm = false;
        scheduler.tick(&cold);
        assert_eq!(scheduler.state(), SchedulerState::Calibrating);

        let mut no_drain = metrics(600);
        no_drain.drain_per_10min = None;
        scheduler.tick(&no_drain);
        assert_eq!(scheduler.state(), SchedulerState::Calibrating);

        scheduler.tick(&metrics(700));
        assert_eq!(scheduler.state(), SchedulerState::Enforcing);
    }

    #[test]
    fn baseline_freeze_emits_event_and_resolves_budget() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), None);
        let mut events = scheduler.subscribe_events();
        scheduler.set_profile(BudgetProfile::Balanced);
        scheduler.tick(&metrics(1_000));

        match events.try_recv().unwrap() {
            SchedulerEvent::BaselineUpdated { baseline, resolved } => {
                assert_eq!(baseline.measured_p95_ms, 1000.0);
                assert_eq!(resolved.p95_latency_ms, Some(1500.0));
                assert_eq!(resolved.memory_ceiling_mb, None);
            }
            other => unreachable!("unexpected event {other:?}"),
        }
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.resolved_budget.unwrap().p95_latency_ms, Some(1500.0));
    }

    #[test]
    fn static_budget_skips_calibration() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), None);
        scheduler.set_static_budget(Budget {
            p95_latency_ms: Some(500.0),
            ..Budget::default()
        });
        assert_eq!(scheduler.state(), SchedulerState::Enforcing);
    }

    #[test]
    fn p95_violation_degrades_the_lowest_priority_workload() {
        let mut scheduler = enforcing_scheduler();
        let mut violations_rx = scheduler.subscribe_violations();

        let mut hot = metrics(3_000);
        hot.p95_ms = Some(2_000.0);
        let violations = scheduler.tick(&hot);

        assert_eq!(violations.len(), 1);
        let v = &violations[0];
        assert_eq!(v.constraint, BudgetConstraint::P95Latency);
        assert!(v.mitigated);
        assert!(!v.observe_only);
        assert_eq!(scheduler.degrade_steps(WorkloadId::Vision), 1);
        assert_eq!(scheduler.degrade_steps(WorkloadId::Text), 0);

        // Delivered on the violation channel too.
        assert_eq!(violations_rx.try_recv().unwrap(), violations[0]);
    }

    #[test]
    fn memory_violations_are_observe_only() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), None);
        scheduler.register(WorkloadId::Vision, WorkloadPriority::Normal);
        scheduler.set_static_budget(Budget {
            memory_ceiling_mb: Some(512),
            ..Budget::default()
        });

        let mut fat = metrics(1_000);
        fat.rss_mb = 900;
        let violations = scheduler.tick(&fat);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].observe_only);
        assert!(!violations[0].mitigated);
        assert_eq!(scheduler.degrade_steps(WorkloadId::Vision), 0);
    }

    #[test]
    fn gate_closes_at_the_floor_and_reopens_next_tick() {
        let mut scheduler = enforcing_scheduler();
        let mut hot = metrics(3_000);
        hot.p95_ms = Some(2_000.0);

        // Three steps to the floor.
        for i in 0..3 {
            hot.now_ms = 3_000 + i * 2_000;
            scheduler.tick(&hot);
        }
        assert_eq!(scheduler.degrade_steps(WorkloadId::Vision), 3);
        assert!(scheduler.admission_open(WorkloadId::Vision));

        // At the floor: the next violation closes the gate for one interval.
        hot.now_ms = 9_200;
        let violations = scheduler.tick(&hot);
        assert!(violations[0].mitigated);
        assert!(!scheduler.admission_open(WorkloadId::Vision));

        // Clean tick: the gate reopens.
        let clean = metrics(11_200);
        scheduler.tick(&clean);
        assert!(scheduler.admission_open(WorkloadId::Vision));
    }

    #[test]
    fn recovery_restores_one_step_per_window() {
        let mut scheduler = enforcing_scheduler();
        let mut hot = metrics(3_000);
        hot.p95_ms = Some(2_000.0);
        scheduler.tick(&hot);
        hot.now_ms = 5_000;
        scheduler.tick(&hot);
        assert_eq!(scheduler.degrade_steps(WorkloadId::Vision), 2);

        // Within budget, but the 15 s window has not elapsed.
        scheduler.tick(&metrics(7_000));
        scheduler.tick(&metrics(14_000));
        assert_eq!(scheduler.degrade_steps(WorkloadId::Vision), 2);

        // Past the window: one step back.
        scheduler.tick(&metrics(23_000));
        assert_eq!(scheduler.degrade_steps(WorkloadId::Vision), 1);

        // The next step needs its own full window.
        scheduler.tick(&metrics(24_000));
        assert_eq!(scheduler.degrade_steps(WorkloadId::Vision), 1);
        scheduler.tick(&metrics(39_000));
        assert_eq!(scheduler.degrade_steps(WorkloadId::Vision), 0);
    }

    #[test]
    fn ties_degrade_the_most_recently_active_workload() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default(), None);
        scheduler.register(WorkloadId::Text, WorkloadPriority::Normal);
        scheduler.register(WorkloadId::Vision, WorkloadPriority::Normal);
        scheduler.note_activity(WorkloadId::Text, 500);
        scheduler.note_activity(WorkloadId::Vision, 900);
        scheduler.set_static_budget(Budget {
            p95_latency_ms: Some(100.0),
            ..Budget::default()
        });

        let mut hot = metrics(1_000);
        hot.p95_ms = Some(500.0);
        scheduler.tick(&hot);
        assert_eq!(scheduler.degrade_steps(WorkloadId::Vision), 1);
        assert_eq!(scheduler.degrade_steps(WorkloadId::Text), 0);
    }

    #[test]
    fn multiple_candidates_are_coalesced_per_constraint() {
        let mut scheduler = enforcing_scheduler();
        let mut awful = metrics(3_000);
        awful.p95_ms = Some(9_000.0);
        awful.drain_per_10min = Some(50.0);
        awful.thermal = ThermalLevel::Critical;

        let violations = scheduler.tick(&awful);
        let mut constraints: Vec<BudgetConstraint> =
            violations.iter().map(|v| v.constraint).collect();
        constraints.dedup();
        assert_eq!(constraints.len(), violations.len(), "one violation per constraint");
        assert_eq!(
            constraints,
            vec![
                BudgetConstraint::P95Latency,
                BudgetConstraint::BatteryDrain,
                BudgetConstraint::Thermal,
            ]
        );
    }

    #[test]
    fn unregistered_workloads_are_always_admitted() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), None);
        assert!(scheduler.admission_open(WorkloadId::Stt));
        assert_eq!(scheduler.degrade_steps(WorkloadId::Stt), 0);
    }
}
