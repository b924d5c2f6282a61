//! Runtime QoS policy: pressure signals in, inference-parameter caps out.
//!
//! Escalation to a higher (more degraded) level is immediate; de-escalation
//! steps down one level at a time, each step gated on the lower level's
//! triggers having been continuously satisfied for the cooldown window. All
//! time arithmetic uses sample timestamps, so the state machine is
//! deterministic under replayed telemetry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::telemetry::{BatteryState, TelemetrySample, ThermalLevel};

/// Quality-of-service level, ordered from full service to paused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum QoSLevel {
    /// No degradation.
    #[default]
    Full,
    /// Mild degradation.
    Reduced,
    /// Heavy degradation.
    Minimal,
    /// Vision paused; text runs at low priority.
    Paused,
}

impl QoSLevel {
    /// One step toward `Paused`; saturates.
    #[must_use]
    pub fn degraded(self) -> Self {
        match self {
            Self::Full => Self::Reduced,
            Self::Reduced => Self::Minimal,
            Self::Minimal | Self::Paused => Self::Paused,
        }
    }

    /// One step toward `Full`, or `None` at the floor.
    #[must_use]
    pub fn relaxed(self) -> Option<Self> {
        match self {
            Self::Full => None,
            Self::Reduced => Some(Self::Full),
            Self::Minimal => Some(Self::Reduced),
            Self::Paused => Some(Self::Minimal),
        }
    }

    /// The inference-parameter caps at this level. Workers apply
    /// `min(request, cap)`.
    #[must_use]
    pub fn overrides(self) -> QosOverrides {
        match self {
            Self::Full => QosOverrides {
                vision_fps_cap: 2,
                vision_max_side_px: Some(640),
                max_tokens_cap: 100,
                vision_allowed: true,
            },
            Self::Reduced => QosOverrides {
                vision_fps_cap: 1,
                vision_max_side_px: Some(480),
                max_tokens_cap: 75,
                vision_allowed: true,
            },
            Self::Minimal => QosOverrides {
                vision_fps_cap: 1,
                vision_max_side_px: Some(320),
                max_tokens_cap: 50,
                vision_allowed: true,
            },
            // Vision stops entirely; text keeps running, low priority, at
            // the minimal token cap.
            Self::Paused => QosOverrides {
                vision_fps_cap: 0,
                vision_max_side_px: None,
                max_tokens_cap: 50,
                vision_allowed: false,
            },
        }
    }
}

/// Concrete parameter caps for one QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosOverrides {
    /// Vision frames per second; 0 means no vision at all.
    pub vision_fps_cap: u32,
    /// Longest-side pixel cap the capture layer should honor.
    pub vision_max_side_px: Option<u32>,
    /// Token cap applied to every generation request.
    pub max_tokens_cap: u32,
    /// Whether `describe_image` is admitted at all.
    pub vision_allowed: bool,
}

/// A QoS transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QoSChange {
    /// Level before the transition.
    pub from: QoSLevel,
    /// Level after the transition.
    pub to: QoSLevel,
    /// The trigger (escalation) or cooldown expiry (de-escalation).
    pub reason: String,
    /// Sample timestamp that drove the transition, unix milliseconds.
    pub at_ms: i64,
}

/// Policy thresholds and hysteresis configuration.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Continuous time a lower level must stay satisfied before one
    /// de-escalation step.
    pub cooldown: Duration,
    /// Available-memory floor below which the runtime pauses.
    pub paused_available_bytes: u64,
    /// Available-memory threshold for `Minimal`.
    pub minimal_available_bytes: u64,
    /// Available-memory threshold for `Reduced`.
    pub reduced_available_bytes: u64,
    /// Battery level (0..1) below which `Minimal` engages when unplugged.
    pub minimal_battery_level: f32,
    /// Battery level (0..1) below which `Reduced` engages when unplugged.
    pub reduced_battery_level: f32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            paused_available_bytes: 50 * 1024 * 1024,
            minimal_available_bytes: 100 * 1024 * 1024,
            reduced_available_bytes: 200 * 1024 * 1024,
            minimal_battery_level: 0.05,
            reduced_battery_level: 0.15,
        }
    }
}

/// Hysteresis state machine producing the active QoS level.
#[derive(Debug)]
pub struct RuntimePolicy {
    config: PolicyConfig,
    level: QoSLevel,
    /// Sample timestamp since which the next lower level has been
    /// continuously satisfied.
    candidate_since_ms: Option<i64>,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

impl RuntimePolicy {
    /// Create a policy at `Full`.
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            level: QoSLevel::Full,
            candidate_since_ms: None,
        }
    }

    /// Active level.
    #[must_use]
    pub fn level(&self) -> QoSLevel {
        self.level
    }

    /// Caps for the active level.
    #[must_use]
    pub fn overrides(&self) -> QosOverrides {
        self.level.overrides()
    }

    /// Feed one telemetry sample; returns the transition if one occurred.
    pub fn observe(&mut self, sample: &TelemetrySample) -> Option<QoSChange> {
        let (required, trigger) = self.required_level(sample);

        if required > self.level {
            // Escalation is immediate, straight to the required level.
            let change = QoSChange {
                from: self.level,
                to: required,
                reason: trigger,
                at_ms: sample.timestamp_ms,
            };
            self.level = required;
            self.candidate_since_ms = None;
            return Some(change);
        }

        if required < self.level {
            let since = *self.candidate_since_ms.get_or_insert(sample.timestamp_ms);
            let elapsed = sample.timestamp_ms.saturating_sub(since);
            if elapsed >= self.config.cooldown.as_millis() as i64 {
                let to = self.level.relaxed().unwrap_or(QoSLevel::Full);
                let change = QoSChange {
                    from: self.level,
                    to,
                    reason: format!(
                        "cooldown satisfied for {}s",
                        self.config.cooldown.as_secs()
                    ),
                    at_ms: sample.timestamp_ms,
                };
                self.level = to;
                // One step per cooldown window: restart the clock.
                self.candidate_since_ms = Some(sample.timestamp_ms);
                return Some(change);
            }
        } else {
            self.candidate_since_ms = None;
        }

        None
    }

    /// The highest level any trigger demands for this sample.
    fn required_level(&self, sample: &TelemetrySample) -> (QoSLevel, String) {
        let cfg = &self.config;
        let on_battery = sample.battery_state != BatteryState::Charging;
        let battery_below = |threshold: f32| {
            on_battery
                && sample
                    .battery_level
                    .is_some_and(|level| level < threshold)
        };

        if sample.thermal == ThermalLevel::Critical {
            return (QoSLevel::Paused, "thermal critical".into());
        }
        if sample.available_bytes < cfg.paused_available_bytes {
            return (QoSLevel::Paused, "available memory exhausted".into());
        }
        if sample.thermal == ThermalLevel::Serious {
            return (QoSLevel::Minimal, "thermal serious".into());
        }
        if battery_below(cfg.minimal_battery_level) {
            return (QoSLevel::Minimal, "battery nearly empty".into());
        }
        if sample.available_bytes < cfg.minimal_available_bytes {
            return (QoSLevel::Minimal, "available memory low".into());
        }
        if sample.thermal == ThermalLevel::Fair {
            return (QoSLevel::Reduced, "thermal fair".into());
        }
        if battery_below(cfg.reduced_battery_level) {
            return (QoSLevel::Reduced, "battery low".into());
        }
        if sample.available_bytes < cfg.reduced_available_bytes {
            return (QoSLevel::Reduced, "available memory tight".into());
        }
        if sample.low_power {
            return (QoSLevel::Reduced, "low-power mode".into());
        }
        (QoSLevel::Full, String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64) -> TelemetrySample {
        TelemetrySample::nominal(ts)
    }

    fn thermal_sample(ts: i64, thermal: ThermalLevel) -> TelemetrySample {
        TelemetrySample {
            thermal,
            ..TelemetrySample::nominal(ts)
        }
    }

    #[test]
    fn escalation_is_immediate_and_skips_intermediate_levels() {
        let mut policy = RuntimePolicy::default();
        let change = policy
            .observe(&thermal_sample(1_000, ThermalLevel::Critical))
            .expect("transition");
        assert_eq!(change.from, QoSLevel::Full);
        assert_eq!(change.to, QoSLevel::Paused);
        assert_eq!(policy.level(), QoSLevel::Paused);
    }

    #[test]
    fn de_escalation_waits_for_the_cooldown() {
        let mut policy = RuntimePolicy::default();
        policy.observe(&thermal_sample(0, ThermalLevel::Serious));
        assert_eq!(policy.level(), QoSLevel::Minimal);

        // Clean samples from t=1s; the streak is still short of 60 s.
        for ts in (1_000..=60_000).step_by(1_000) {
            assert!(policy.observe(&sample(ts)).is_none());
        }
        // 60 s of continuously clean samples releases exactly one step.
        let change = policy.observe(&sample(61_000)).expect("step down");
        assert_eq!(change.to, QoSLevel::Reduced);
        assert_eq!(policy.level(), QoSLevel::Reduced);
    }

    #[test]
    fn de_escalation_is_one_step_per_cooldown() {
        let mut policy = RuntimePolicy::default();
        policy.observe(&thermal_sample(0, ThermalLevel::Critical));
        assert_eq!(policy.level(), QoSLevel::Paused);

        let mut transitions = Vec::new();
        for ts in (1_000..=250_000).step_by(1_000) {
            if let Some(change) = policy.observe(&sample(ts)) {
                transitions.push((ts, change.to));
            }
        }
        let levels: Vec<QoSLevel> = transitions.iter().map(|(_, l)| *l).collect();
        assert_eq!(
            levels,
            vec![QoSLevel::Minimal, QoSLevel::Reduced, QoSLevel::Full]
        );
        // Each step at least 60 s after the previous.
        for pair in transitions.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= 60_000);
        }
    }

    #[test]
    fn dirty_sample_resets_the_cooldown() {
        let mut policy = RuntimePolicy::default();
        policy.observe(&thermal_sample(0, ThermalLevel::Serious));

        for ts in (1_000..50_000).step_by(1_000) {
            policy.observe(&sample(ts));
        }
        // Pressure returns at 50 s; the clean streak restarts.
        policy.observe(&thermal_sample(50_000, ThermalLevel::Serious));
        for ts in (51_000..111_000).step_by(1_000) {
            assert!(policy.observe(&sample(ts)).is_none());
        }
        let change = policy.observe(&sample(111_000)).expect("step down");
        assert_eq!(change.to, QoSLevel::Reduced);
    }

    #[test]
    fn battery_triggers_ignore_charging() {
        let mut policy = RuntimePolicy::default();
        let mut low_battery = TelemetrySample::nominal(1_000);
        low_battery.battery_level = Some(0.04);
        low_battery.battery_state = BatteryState::Charging;
        assert!(policy.observe(&low_battery).is_none());

        low_battery.timestamp_ms = 2_000;
        low_battery.battery_state = BatteryState::Unplugged;
        let change = policy.observe(&low_battery).expect("transition");
        assert_eq!(change.to, QoSLevel::Minimal);
    }

    #[test]
    fn low_power_mode_reduces() {
        let mut policy = RuntimePolicy::default();
        let mut s = TelemetrySample::nominal(1_000);
        s.low_power = true;
        assert_eq!(policy.observe(&s).unwrap().to, QoSLevel::Reduced);
    }

    #[test]
    fn memory_thresholds_pick_the_highest_level() {
        let mut policy = RuntimePolicy::default();
        let mut s = TelemetrySample::nominal(1_000);
        s.available_bytes = 40 * 1024 * 1024;
        assert_eq!(policy.observe(&s).unwrap().to, QoSLevel::Paused);
    }

    #[test]
    fn paused_disallows_vision_but_keeps_text() {
        let overrides = QoSLevel::Paused.overrides();
        assert!(!overrides.vision_allowed);
        assert_eq!(overrides.vision_fps_cap, 0);
        assert!(overrides.max_tokens_cap > 0);
    }
}
