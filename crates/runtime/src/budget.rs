//! Declarative compute budgets and adaptive budget profiles.

use serde::{Deserialize, Serialize};

use crate::telemetry::ThermalLevel;

/// Budget dimension, in mitigation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetConstraint {
    /// 95th-percentile request latency.
    P95Latency,
    /// Battery drain rate per 10 minutes.
    BatteryDrain,
    /// Thermal level ceiling.
    Thermal,
    /// RSS ceiling. Observe-only: the scheduler never unloads a model.
    MemoryCeiling,
}

/// A declarative constraint set; `None` means no constraint on that
/// dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Budget {
    /// p95 latency ceiling in milliseconds.
    pub p95_latency_ms: Option<f64>,
    /// Battery drain ceiling in percent per 10 minutes.
    pub battery_drain_per_10min: Option<f64>,
    /// Thermal level ceiling.
    pub max_thermal_level: Option<ThermalLevel>,
    /// RSS ceiling in megabytes. Advisory; violations are observe-only.
    pub memory_ceiling_mb: Option<u64>,
}

impl Budget {
    /// Whether no dimension is constrained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.p95_latency_ms.is_none()
            && self.battery_drain_per_10min.is_none()
            && self.max_thermal_level.is_none()
            && self.memory_ceiling_mb.is_none()
    }
}

/// Named adaptive tuning resolved against a measured baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetProfile {
    /// Tight drain budget, roomy latency, throttle early.
    Conservative,
    /// Hold the measured envelope.
    Balanced,
    /// Trade battery and heat for speed.
    Performance,
}

struct ProfileMultipliers {
    p95: f64,
    drain: f64,
    thermal_floor: ThermalLevel,
}

impl BudgetProfile {
    fn multipliers(self) -> ProfileMultipliers {
        match self {
            Self::Conservative => ProfileMultipliers {
                p95: 2.0,
                drain: 0.6,
                thermal_floor: ThermalLevel::Fair,
            },
            Self::Balanced => ProfileMultipliers {
                p95: 1.5,
                drain: 1.0,
                thermal_floor: ThermalLevel::Serious,
            },
            Self::Performance => ProfileMultipliers {
                p95: 1.1,
                drain: 1.5,
                thermal_floor: ThermalLevel::Critical,
            },
        }
    }
}

/// Empirically observed performance used as the adaptive reference point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasuredBaseline {
    /// Measured p95 latency in milliseconds.
    pub measured_p95_ms: f64,
    /// Measured drain in percent per 10 minutes.
    pub measured_drain_per_10min: f64,
    /// Thermal level at measurement time.
    pub current_thermal_level: ThermalLevel,
    /// RSS at measurement time, in megabytes.
    pub current_rss_mb: u64,
    /// Latency observations behind the measurement.
    pub sample_count: usize,
    /// Measurement time, unix milliseconds.
    pub measured_at_ms: i64,
}

/// Floor for resolved drain budgets, avoiding a degenerate zero ceiling.
const DRAIN_FLOOR: f64 = 0.1;

/// Resolve a profile against a baseline. Pure: equal inputs always produce
/// an equal budget.
///
/// The memory dimension is never set here; a loaded model cannot shrink, so
/// memory stays observe-only.
#[must_use]
pub fn resolve(profile: BudgetProfile, baseline: &MeasuredBaseline) -> Budget {
    let m = profile.multipliers();
    Budget {
        p95_latency_ms: Some(baseline.measured_p95_ms * m.p95),
        battery_drain_per_10min: Some(
            (baseline.measured_drain_per_10min * m.drain).max(DRAIN_FLOOR),
        ),
        max_thermal_level: Some(m.thermal_floor),
        memory_ceiling_mb: None,
    }
}

/// Sanity-check a caller-supplied budget, returning human-readable warnings.
#[must_use]
pub fn validate(budget: &Budget) -> Vec<String> {
    let mut warnings = Vec::new();
    if budget.memory_ceiling_mb.is_some() {
        warnings.push(
            "memory_ceiling_mb is advisory: the runtime cannot shrink a loaded model, so \
             violations are observe-only"
                .to_string(),
        );
    }
    if let Some(p95) = budget.p95_latency_ms {
        if p95 < 100.0 {
            warnings.push(format!(
                "p95_latency_ms = {p95} is likely unreachable on-device"
            ));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> MeasuredBaseline {
        MeasuredBaseline {
            measured_p95_ms: 1000.0,
            measured_drain_per_10min: 2.0,
            current_thermal_level: ThermalLevel::Nominal,
            current_rss_mb: 900,
            sample_count: 25,
            measured_at_ms: 1_000,
        }
    }

    #[test]
    fn resolve_is_a_pure_function_of_its_inputs() {
        let a = resolve(BudgetProfile::Balanced, &baseline());
        let b = resolve(BudgetProfile::Balanced, &baseline());
        assert_eq!(a, b);
    }

    #[test]
    fn balanced_profile_multipliers() {
        let budget = resolve(BudgetProfile::Balanced, &baseline());
        assert_eq!(budget.p95_latency_ms, Some(1500.0));
        assert_eq!(budget.battery_drain_per_10min, Some(2.0));
        assert_eq!(budget.max_thermal_level, Some(ThermalLevel::Serious));
        assert_eq!(budget.memory_ceiling_mb, None);
    }

    #[test]
    fn conservative_tightens_drain_and_thermal() {
        let budget = resolve(BudgetProfile::Conservative, &baseline());
        assert_eq!(budget.p95_latency_ms, Some(2000.0));
        let drain = budget.battery_drain_per_10min.unwrap();
        assert!((drain - 1.2).abs() < 1e-9, "drain was {drain}");
        assert_eq!(budget.max_thermal_level, Some(ThermalLevel::Fair));
    }

    #[test]
    fn performance_allows_critical_thermal() {
        let budget = resolve(BudgetProfile::Performance, &baseline());
        assert_eq!(budget.max_thermal_level, Some(ThermalLevel::Critical));
        assert_eq!(budget.battery_drain_per_10min, Some(3.0));
    }

    #[test]
    fn zero_measured_drain_gets_a_floor() {
        let mut b = baseline();
        b.measured_drain_per_10min = 0.0;
        let budget = resolve(BudgetProfile::Balanced, &b);
        assert_eq!(budget.battery_drain_per_10min, Some(0.1));
    }

    #[test]
    fn validate_flags_memory_and_unreachable_latency() {
        let budget = Budget {
            p95_latency_ms: Some(50.0),
            memory_ceiling_mb: Some(512),
            ..Budget::default()
        };
        let warnings = validate(&budget);
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("observe-only")));
        assert!(warnings.iter().any(|w| w.contains("unreachable")));
    }

    #[test]
    fn empty_budget_reports_empty() {
        assert!(Budget::default().is_empty());
        assert!(!resolve(BudgetProfile::Balanced, &baseline()).is_empty());
    }
}
