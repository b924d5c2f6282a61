//! Sliding-window statistics derived from telemetry and request timings.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::telemetry::{BatteryState, TelemetrySample, ThermalLevel};

/// One completed request's timing record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyObservation {
    /// Request identifier.
    pub request_id: u64,
    /// Start time, unix milliseconds.
    pub started_at_ms: i64,
    /// Completion time, unix milliseconds; never before `started_at_ms`.
    pub completed_at_ms: i64,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Tokens produced.
    pub tokens_generated: u32,
}

/// Ring buffer of latency observations with percentile accessors.
#[derive(Debug)]
pub struct LatencyTracker {
    window: usize,
    warm_threshold: usize,
    observations: VecDeque<LatencyObservation>,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW, Self::DEFAULT_WARM_THRESHOLD)
    }
}

impl LatencyTracker {
    /// Default observation window.
    pub const DEFAULT_WINDOW: usize = 100;

    /// Default observation count before the tracker is warm.
    pub const DEFAULT_WARM_THRESHOLD: usize = 20;

    /// Create a tracker with the given window and warm threshold.
    #[must_use]
    pub fn new(window: usize, warm_threshold: usize) -> Self {
        Self {
            window: window.max(1),
            warm_threshold: warm_threshold.max(1),
            observations: VecDeque::new(),
        }
    }

    /// Record one observation, evicting the oldest past the window.
    pub fn record(&mut self, observation: LatencyObservation) {
        self.observations.push_back(observation);
        while self.observations.len() > self.window {
            self.observations.pop_front();
        }
    }

    /// Observations currently in the window.
    #[must_use]
    pub fn count(&self) -> usize {
        self.observations.len()
    }

    /// Whether enough observations exist for stable percentiles.
    #[must_use]
    pub fn is_warm(&self) -> bool {
        self.observations.len() >= self.warm_threshold
    }

    /// Latency percentile in milliseconds; `None` when empty.
    #[must_use]
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.observations.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.observations.iter().map(|o| o.latency_ms).collect();
        sorted.sort_unstable();
        let rank = (p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank] as f64)
    }

    /// Median latency.
    #[must_use]
    pub fn p50(&self) -> Option<f64> {
        self.percentile(0.50)
    }

    /// 95th-percentile latency.
    #[must_use]
    pub fn p95(&self) -> Option<f64> {
        self.percentile(0.95)
    }

    /// 99th-percentile latency.
    #[must_use]
    pub fn p99(&self) -> Option<f64> {
        self.percentile(0.99)
    }

    /// Fastest observation.
    #[must_use]
    pub fn min(&self) -> Option<u64> {
        self.observations.iter().map(|o| o.latency_ms).min()
    }

    /// Slowest observation.
    #[must_use]
    pub fn max(&self) -> Option<u64> {
        self.observations.iter().map(|o| o.latency_ms).max()
    }

    /// Mean latency.
    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        if self.observations.is_empty() {
            return None;
        }
        let total: u64 = self.observations.iter().map(|o| o.latency_ms).sum();
        Some(total as f64 / self.observations.len() as f64)
    }
}

/// Memory usage snapshot exposed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MemoryStats {
    /// Most recent RSS in bytes.
    pub current_rss_bytes: u64,
    /// Peak RSS observed since start.
    pub peak_rss_bytes: u64,
    /// Mean RSS over the sample window.
    pub average_rss_bytes: u64,
    /// Most recent available-memory reading.
    pub available_bytes: u64,
}

/// Tracks current/peak/average RSS over a bounded sample window.
#[derive(Debug)]
pub struct ResourceMonitor {
    window: usize,
    samples: VecDeque<u64>,
    peak: u64,
    available: u64,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

impl ResourceMonitor {
    /// Default RSS sample window.
    pub const DEFAULT_WINDOW: usize = 60;

    /// Create a monitor with the given window.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
            peak: 0,
            available: 0,
        }
    }

    /// Record an RSS sample plus the matching availability reading.
    pub fn record(&mut self, rss_bytes: u64, available_bytes: u64) {
        self.peak = self.peak.max(rss_bytes);
        self.available = available_bytes;
        self.samples.push_back(rss_bytes);
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    /// Most recent RSS sample.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.samples.back().copied().unwrap_or(0)
    }

    /// Peak RSS since construction.
    #[must_use]
    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// Mean RSS over the window.
    #[must_use]
    pub fn average(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let total: u128 = self.samples.iter().map(|v| u128::from(*v)).sum();
        (total / self.samples.len() as u128) as u64
    }

    /// Snapshot for the public API.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            current_rss_bytes: self.current(),
            peak_rss_bytes: self.peak(),
            average_rss_bytes: self.average(),
            available_bytes: self.available,
        }
    }
}

/// Latest thermal level plus listener fan-out.
#[derive(Debug)]
pub struct ThermalMonitor {
    level: ThermalLevel,
    listeners: broadcast::Sender<ThermalLevel>,
}

impl Default for ThermalMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThermalMonitor {
    /// Create a monitor at nominal.
    #[must_use]
    pub fn new() -> Self {
        let (listeners, _) = broadcast::channel(32);
        Self {
            level: ThermalLevel::Nominal,
            listeners,
        }
    }

    /// Feed a thermal reading; listeners hear only changes.
    pub fn observe(&mut self, level: ThermalLevel) {
        if self.level != level {
            self.level = level;
            let _ = self.listeners.send(level);
        }
    }

    /// Register a listener for thermal changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ThermalLevel> {
        self.listeners.subscribe()
    }

    /// Latest thermal level.
    #[must_use]
    pub fn level(&self) -> ThermalLevel {
        self.level
    }

    /// Whether the device is at the critical level.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.level == ThermalLevel::Critical
    }

    /// Whether inference should throttle (serious or worse).
    #[must_use]
    pub fn should_throttle(&self) -> bool {
        self.level >= ThermalLevel::Serious
    }
}

/// Battery drain estimator: %/10 min from a least-squares fit over recent
/// samples. Charging samples are excluded; unknown until at least two usable
/// samples span a nonzero interval.
#[derive(Debug)]
pub struct BatteryDrainTracker {
    window: usize,
    samples: VecDeque<(i64, f32)>,
}

impl Default for BatteryDrainTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

impl BatteryDrainTracker {
    /// Default sample window.
    pub const DEFAULT_WINDOW: usize = 20;

    /// Create a tracker with the given window.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            samples: VecDeque::new(),
        }
    }

    /// Feed a telemetry sample. Samples while charging (or without battery
    /// data) are skipped.
    pub fn observe(&mut self, sample: &TelemetrySample) {
        if sample.battery_state == BatteryState::Charging {
            return;
        }
        let Some(level) = sample.battery_level else {
            return;
        };
        self.samples.push_back((sample.timestamp_ms, level));
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    /// Usable samples currently in the window.
    #[must_use]
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Drain rate in percent per 10 minutes; `None` until warm.
    ///
    /// Least-squares slope of (time, level) over the window, chosen over an
    /// endpoints difference for jitter tolerance. Clamped at zero so brief
    /// level upticks read as "no drain" rather than negative drain.
    #[must_use]
    pub fn drain_per_10min(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let n = self.samples.len() as f64;
        let t0 = self.samples.front()?.0;
        let mean_t = self
            .samples
            .iter()
            .map(|(t, _)| (*t - t0) as f64)
            .sum::<f64>()
            / n;
        let mean_level = self.samples.iter().map(|(_, l)| f64::from(*l)).sum::<f64>() / n;

        let mut covar = 0.0;
        let mut var = 0.0;
        for (t, level) in &self.samples {
            let dt = (*t - t0) as f64 - mean_t;
            covar += dt * (f64::from(*level) - mean_level);
            var += dt * dt;
        }
        if var == 0.0 {
            return None;
        }
        let slope_per_ms = covar / var;
        // level is 0..1; scale to percent per 10 minutes.
        let drain = -slope_per_ms * 600_000.0 * 100.0;
        Some(drain.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(id: u64, latency_ms: u64) -> LatencyObservation {
        LatencyObservation {
            request_id: id,
            started_at_ms: 0,
            completed_at_ms: latency_ms as i64,
            latency_ms,
            tokens_generated: 1,
        }
    }

    #[test]
    fn latency_percentiles_over_a_full_window() {
        let mut tracker = LatencyTracker::new(100, 20);
        for i in 1..=100 {
            tracker.record(obs(i, i * 10));
        }
        assert!(tracker.is_warm());
        assert_eq!(tracker.p50(), Some(510.0));
        assert_eq!(tracker.p95(), Some(950.0));
        assert_eq!(tracker.min(), Some(10));
        assert_eq!(tracker.max(), Some(1000));
        assert_eq!(tracker.mean(), Some(505.0));
    }

    #[test]
    fn latency_window_evicts_oldest() {
        let mut tracker = LatencyTracker::new(3, 2);
        for i in 1..=5 {
            tracker.record(obs(i, i));
        }
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.min(), Some(3));
    }

    #[test]
    fn warm_flag_tracks_threshold() {
        let mut tracker = LatencyTracker::new(100, 3);
        tracker.record(obs(1, 5));
        tracker.record(obs(2, 5));
        assert!(!tracker.is_warm());
        tracker.record(obs(3, 5));
        assert!(tracker.is_warm());
    }

    #[test]
    fn resource_monitor_tracks_peak_and_average() {
        let mut monitor = ResourceMonitor::new(4);
        monitor.record(100, 1000);
        monitor.record(300, 900);
        monitor.record(200, 800);
        assert_eq!(monitor.current(), 200);
        assert_eq!(monitor.peak(), 300);
        assert_eq!(monitor.average(), 200);
        assert_eq!(monitor.stats().available_bytes, 800);
    }

    #[test]
    fn thermal_monitor_thresholds() {
        let mut monitor = ThermalMonitor::new();
        assert!(!monitor.should_throttle());
        monitor.observe(ThermalLevel::Serious);
        assert!(monitor.should_throttle());
        assert!(!monitor.is_critical());
        monitor.observe(ThermalLevel::Critical);
        assert!(monitor.is_critical());
    }

    #[test]
    fn thermal_listeners_hear_edges_only() {
        let mut monitor = ThermalMonitor::new();
        let mut rx = monitor.subscribe();
        monitor.observe(ThermalLevel::Nominal); // no change from initial
        monitor.observe(ThermalLevel::Fair);
        monitor.observe(ThermalLevel::Fair);
        assert_eq!(rx.try_recv().unwrap(), ThermalLevel::Fair);
        assert!(rx.try_recv().is_err());
    }

    fn battery_sample(ts: i64, level: f32, state: BatteryState) -> TelemetrySample {
        TelemetrySample {
            battery_level: Some(level),
            battery_state: state,
            ..TelemetrySample::nominal(ts)
        }
    }

    #[test]
    fn drain_rate_from_linear_decline() {
        let mut tracker = BatteryDrainTracker::new(20);
        // 1% drop per minute => 10% per 10 minutes.
        for minute in 0..5 {
            tracker.observe(&battery_sample(
                minute * 60_000,
                1.0 - 0.01 * minute as f32,
                BatteryState::Unplugged,
            ));
        }
        let drain = tracker.drain_per_10min().unwrap();
        assert!((drain - 10.0).abs() < 0.1, "drain was {drain}");
    }

    #[test]
    fn drain_unknown_until_two_samples() {
        let mut tracker = BatteryDrainTracker::new(20);
        assert_eq!(tracker.drain_per_10min(), None);
        tracker.observe(&battery_sample(0, 0.9, BatteryState::Unplugged));
        assert_eq!(tracker.drain_per_10min(), None);
        tracker.observe(&battery_sample(60_000, 0.89, BatteryState::Unplugged));
        assert!(tracker.drain_per_10min().is_some());
    }

    #[test]
    fn charging_samples_are_excluded() {
        let mut tracker = BatteryDrainTracker::new(20);
        tracker.observe(&battery_sample(0, 0.5, BatteryState::Charging));
        tracker.observe(&battery_sample(60_000, 0.6, BatteryState::Charging));
        assert_eq!(tracker.count(), 0);
        assert_eq!(tracker.drain_per_10min(), None);
    }

    #[test]
    fn rising_level_clamps_to_zero_drain() {
        let mut tracker = BatteryDrainTracker::new(20);
        tracker.observe(&battery_sample(0, 0.5, BatteryState::Unplugged));
        tracker.observe(&battery_sample(60_000, 0.55, BatteryState::Unplugged));
        assert_eq!(tracker.drain_per_10min(), Some(0.0));
    }
}
