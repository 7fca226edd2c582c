//! Engine settings and pass results.

use chrono::TimeDelta;

use super::monitor::DEFAULT_HISTORY_CAPACITY;

/// Timing parameters of the orchestrator.
///
/// # Examples
///
/// ```
/// use chrono::TimeDelta;
/// use peak_guard::engine::EngineSettings;
///
/// let settings = EngineSettings::immediate();
/// assert_eq!(settings.manage_debounce, TimeDelta::zero());
/// assert_eq!(settings.guard_interval, TimeDelta::seconds(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Period of the guard tick re-evaluating every consumer.
    pub guard_interval: TimeDelta,
    /// Coalescing delay for admission passes; zero runs them synchronously.
    pub manage_debounce: TimeDelta,
    /// Coalescing delay for state reports; zero reports synchronously.
    pub report_debounce: TimeDelta,
    /// Settling time after a change before the next rebalance/admission, and
    /// the rolling-average window.
    pub min_change_interval: TimeDelta,
    /// Samples kept per grid direction.
    pub history_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            guard_interval: TimeDelta::seconds(10),
            manage_debounce: TimeDelta::seconds(1),
            report_debounce: TimeDelta::seconds(1),
            min_change_interval: TimeDelta::seconds(30),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl EngineSettings {
    /// Default timings with both debounce stages disabled.
    pub fn immediate() -> Self {
        Self {
            manage_debounce: TimeDelta::zero(),
            report_debounce: TimeDelta::zero(),
            ..Self::default()
        }
    }
}

/// What one admission/eviction pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassOutcome {
    /// Another pass held the gate; nothing was evaluated.
    pub skipped: bool,
    /// Wattage change realised by rebalancing dynamic loads.
    pub dynamic_net_change: f64,
    /// Consumers started this pass, in admission order.
    pub admitted: Vec<String>,
    /// Consumers stopped this pass, in eviction order.
    pub evicted: Vec<String>,
    /// Total expected wattage change of the pass.
    pub net_change: f64,
    /// Instantaneous load estimate after the pass (W).
    pub estimated_load: f64,
    /// Rolling-average load estimate after the pass (W).
    pub estimated_average_load: f64,
}

impl PassOutcome {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn changed(&self) -> bool {
        self.net_change != 0.0 || !self.admitted.is_empty() || !self.evicted.is_empty()
    }
}
