//! One admission/eviction pass over every consumer.
//!
//! Order within a pass:
//! 1. rebalance running dynamic loads
//! 2. admit critical consumers, then consumers that need energy
//! 3. evict orphans, then prefer-solar eviction, then hard eviction above peak
//! 4. coordinate battery discharging

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDateTime;

use super::clock::Scheduler;
use super::orchestrator::Orchestrator;
use super::types::PassOutcome;
use crate::devices::{Consumer, ConsumerState};
use crate::devices::consumer::{ALL_GROUPS, Actuation};

/// Exclusive right to run a pass. Released on drop.
pub(crate) struct PassPermit {
    gate: Arc<AtomicBool>,
}

impl PassPermit {
    /// Returns `None` when another pass holds the gate.
    pub(crate) fn try_acquire(gate: &Arc<AtomicBool>) -> Option<Self> {
        gate.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self {
                gate: Arc::clone(gate),
            })
    }
}

impl Drop for PassPermit {
    fn drop(&mut self) {
        self.gate.store(false, Ordering::Release);
    }
}

/// Running estimates carried through a pass.
#[derive(Debug, Clone, Copy)]
struct Estimate {
    instant: f64,
    average: f64,
}

impl Estimate {
    fn add(&mut self, watts: f64) {
        self.instant += watts;
        self.average += watts;
    }

    fn fits(&self, extra: f64, headroom: f64, limit: f64) -> bool {
        self.instant + extra - headroom <= limit && self.average + extra - headroom <= limit
    }

    fn above(&self, headroom: f64, threshold: f64) -> bool {
        self.instant - headroom > threshold && self.average - headroom > threshold
    }

    fn exceeds(&self, limit: f64) -> bool {
        self.instant > limit || self.average > limit
    }
}

/// What a running or starting consumer counts for in the estimate: its
/// measured draw, raised to its peak while it is still ramping up.
fn planned_load(consumer: &Consumer) -> f64 {
    consumer.current_load().max(consumer.peak_load())
}

impl<S: Scheduler> Orchestrator<S> {
    /// Runs one admission/eviction pass.
    ///
    /// Returns a skipped outcome without touching anything when another pass
    /// holds the gate.
    pub fn manage(&mut self) -> PassOutcome {
        let Some(_permit) = PassPermit::try_acquire(&self.gate) else {
            tracing::info!("admission pass already in flight, skipping");
            return PassOutcome::skipped();
        };

        let now = self.scheduler.now();
        let peak = self.monitor.peak_load();
        let current = self.monitor.current_load();
        let average = self
            .monitor
            .average_load_since(now, self.settings.min_change_interval);
        let settled = self
            .last_change
            .is_none_or(|at| now - at >= self.settings.min_change_interval);

        // headroom is measured before anything moves
        let releasable: Vec<f64> = self
            .consumers
            .iter()
            .map(|c| match c.dynamic() {
                Some(d) if c.is_running() => d.releasable_power(),
                _ => 0.0,
            })
            .collect();

        let mut outcome = PassOutcome::default();

        let dnc = if settled {
            self.rebalance_dynamic_loads(now, peak, current.max(average))
        } else {
            0.0
        };
        outcome.dynamic_net_change = dnc;

        let mut estimate = Estimate {
            instant: current + dnc,
            average: average + dnc,
        };
        for c in &self.consumers {
            if c.is_running() || c.pending(now) == Some(Actuation::Start) {
                estimate.add(planned_load(c) - c.current_load());
            }
        }

        let mut net_change = dnc;

        if settled {
            net_change += self.admit(
                now,
                peak,
                ConsumerState::CriticallyNeedsEnergy,
                Estimate {
                    instant: current,
                    average,
                },
                &mut estimate,
                &releasable,
                dnc,
                &mut outcome,
            );
            net_change += self.admit(
                now,
                peak,
                ConsumerState::NeedsEnergy,
                Estimate {
                    instant: current,
                    average,
                },
                &mut estimate,
                &releasable,
                dnc,
                &mut outcome,
            );
        }

        net_change -= self.evict_orphans(now, &mut estimate, &mut outcome);
        if settled {
            net_change -= self.evict_prefer_solar(
                now,
                peak,
                &mut estimate,
                &releasable,
                dnc,
                &mut outcome,
            );
        }
        net_change -=
            self.evict_above_peak(now, peak, &mut estimate, &releasable, dnc, &mut outcome);

        self.coordinate_batteries(now);

        if net_change != 0.0 {
            self.last_change = Some(now);
        }
        outcome.net_change = net_change;
        outcome.estimated_load = estimate.instant;
        outcome.estimated_average_load = estimate.average;

        tracing::debug!(
            peak,
            current,
            average,
            dynamic_net_change = dnc,
            net_change,
            admitted = outcome.admitted.len(),
            evicted = outcome.evicted.len(),
            "admission pass done"
        );
        outcome
    }

    /// Nudges every running dynamic load towards its balancing target.
    /// Returns the realised change in watts.
    fn rebalance_dynamic_loads(&mut self, now: NaiveDateTime, peak: f64, load: f64) -> f64 {
        let mut dnc = 0.0;
        for consumer in &mut self.consumers {
            if !consumer.is_running()
                || consumer.state() == ConsumerState::Off
                || consumer.pending(now) == Some(Actuation::Stop)
            {
                continue;
            }
            let Some(dynamic) = consumer.dynamic_mut() else {
                continue;
            };

            let target = dynamic.balancing_method().target_load(peak);
            let result = dynamic.rebalance(load + dnc - target);
            if let Some(command) = result.command {
                tracing::info!(
                    consumer = consumer.name(),
                    change_w = result.realized_w,
                    "dynamic load rebalanced"
                );
                self.outbox.push(command);
            }
            dnc += result.realized_w;
        }
        dnc
    }

    /// Admits waiting consumers in `class`, in list order.
    ///
    /// Returns the peak load added.
    #[expect(clippy::too_many_arguments)]
    fn admit(
        &mut self,
        now: NaiveDateTime,
        peak: f64,
        class: ConsumerState,
        initial: Estimate,
        estimate: &mut Estimate,
        releasable: &[f64],
        dnc: f64,
        outcome: &mut PassOutcome,
    ) -> f64 {
        let mut added = 0.0;
        for index in 0..self.consumers.len() {
            let consumer = &self.consumers[index];
            if consumer.state() != class || consumer.is_running() || !consumer.can_start(now) {
                continue;
            }

            let load = consumer.peak_load();
            let headroom = self.headroom(now, Some(index), releasable, dnc);

            let admissible = if class == ConsumerState::CriticallyNeedsEnergy {
                estimate.fits(load, headroom, peak)
            } else {
                // dynamic loads adjust their own draw, so they compare against
                // the load before this pass moved anything
                let basis = if consumer.dynamic().is_some() {
                    initial
                } else {
                    *estimate
                };
                let switch_on = consumer.switch_on_load();
                basis.instant - headroom <= switch_on
                    && basis.average - headroom <= switch_on
                    && estimate.fits(load, headroom, peak)
            };

            if !admissible {
                tracing::debug!(
                    consumer = consumer.name(),
                    load,
                    estimated = estimate.instant,
                    headroom,
                    "consumer deferred"
                );
                continue;
            }

            let name = consumer.name().to_string();
            if self.start_at(index, now) {
                tracing::info!(consumer = %name, load, state = %class, "consumer admitted");
                estimate.add(load);
                added += load;
                outcome.admitted.push(name);
            }
        }
        added
    }

    /// Stops consumers that want to be off but are still running.
    fn evict_orphans(
        &mut self,
        now: NaiveDateTime,
        estimate: &mut Estimate,
        outcome: &mut PassOutcome,
    ) -> f64 {
        let mut removed = 0.0;
        for index in 0..self.consumers.len() {
            let consumer = &self.consumers[index];
            if consumer.state() != ConsumerState::Off
                || !consumer.is_running()
                || consumer.pending(now) == Some(Actuation::Stop)
            {
                continue;
            }
            let draw = planned_load(consumer);
            if self.stop_at(index, now) {
                removed += self.record_eviction(index, draw, estimate, outcome);
            }
        }
        removed
    }

    /// Sheds running consumers whose switch-off threshold is exceeded, most
    /// demanding threshold first.
    fn evict_prefer_solar(
        &mut self,
        now: NaiveDateTime,
        peak: f64,
        estimate: &mut Estimate,
        releasable: &[f64],
        dnc: f64,
        outcome: &mut PassOutcome,
    ) -> f64 {
        let mut removed = 0.0;
        for index in self.eviction_order(now) {
            let consumer = &self.consumers[index];
            if !consumer.can_force_stop(now) {
                continue;
            }

            // a dynamic load is only shed once it exceeds its own balancing target
            let threshold = match consumer.dynamic() {
                Some(d) => consumer
                    .switch_off_load()
                    .max(d.balancing_method().target_load(peak)),
                None => consumer.switch_off_load(),
            };
            let headroom = self.headroom(now, Some(index), releasable, dnc);
            if !estimate.above(headroom, threshold) {
                continue;
            }

            let draw = planned_load(consumer);
            if self.stop_at(index, now) {
                removed += self.record_eviction(index, draw, estimate, outcome);
            }
        }
        removed
    }

    /// Evicts one consumer at a time until both estimates are within peak.
    fn evict_above_peak(
        &mut self,
        now: NaiveDateTime,
        peak: f64,
        estimate: &mut Estimate,
        releasable: &[f64],
        dnc: f64,
        outcome: &mut PassOutcome,
    ) -> f64 {
        if !estimate.exceeds(peak) || self.headroom(now, None, releasable, dnc) > 0.0 {
            return 0.0;
        }

        let dynamic_adjusted = dnc != 0.0;
        let mut removed = 0.0;
        for index in self.eviction_order(now) {
            if !estimate.exceeds(peak) {
                break;
            }
            let consumer = &self.consumers[index];
            if (dynamic_adjusted && consumer.dynamic().is_some())
                || !consumer.can_force_stop_on_peak_load(now)
            {
                continue;
            }

            let draw = planned_load(consumer);
            if self.stop_at(index, now) {
                tracing::warn!(
                    consumer = self.consumers[index].name(),
                    estimated = estimate.instant,
                    peak,
                    "evicting to stay below peak"
                );
                removed += self.record_eviction(index, draw, estimate, outcome);
            }
        }

        if estimate.exceeds(peak) {
            tracing::warn!(
                estimated = estimate.instant,
                estimated_average = estimate.average,
                peak,
                "load stays above peak, nothing left to evict"
            );
        }
        removed
    }

    fn record_eviction(
        &self,
        index: usize,
        draw: f64,
        estimate: &mut Estimate,
        outcome: &mut PassOutcome,
    ) -> f64 {
        let name = self.consumers[index].name().to_string();
        tracing::info!(consumer = %name, draw, "consumer evicted");
        estimate.add(-draw);
        outcome.evicted.push(name);
        draw
    }

    /// Running consumers without a pending stop, highest switch-off load first.
    fn eviction_order(&self, now: NaiveDateTime) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.consumers.len())
            .filter(|&i| {
                let c = &self.consumers[i];
                c.is_running() && c.pending(now) != Some(Actuation::Stop)
            })
            .collect();
        order.sort_by(|&a, &b| {
            let a = self.consumers[a].switch_off_load();
            self.consumers[b].switch_off_load().total_cmp(&a)
        });
        order
    }

    /// Power that running dynamic loads balancing on behalf of `candidate`'s
    /// groups could release, netted with the change already realised.
    ///
    /// `None` asks for the global headroom, which only counts the `all` group.
    fn headroom(
        &self,
        now: NaiveDateTime,
        candidate: Option<usize>,
        releasable: &[f64],
        dnc: f64,
    ) -> f64 {
        let groups: &[String] = candidate.map_or(&[], |i| self.consumers[i].groups());

        let total: f64 = self
            .consumers
            .iter()
            .enumerate()
            .filter(|(i, c)| Some(*i) != candidate && c.pending(now) != Some(Actuation::Stop))
            .filter_map(|(i, c)| {
                let group = c.dynamic()?.balance_on_behalf_of()?;
                let matches = group == ALL_GROUPS || groups.iter().any(|g| g == group);
                matches.then_some(releasable[i])
            })
            .sum();

        if total <= 0.0 {
            return 0.0;
        }
        (total + dnc).max(0.0)
    }

    /// Disables discharging everywhere while a running dynamic load refuses
    /// battery power, enables it otherwise.
    fn coordinate_batteries(&mut self, now: NaiveDateTime) {
        let block = self.consumers.iter().any(|c| {
            c.is_running() && c.dynamic().is_some_and(|d| !d.allows_battery_power())
        });

        for battery in &mut self.batteries {
            let command = if block {
                battery.disable_discharging(now)
            } else {
                battery.enable_discharging(now)
            };
            self.outbox.extend(command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_is_exclusive_and_released_on_drop() {
        let gate = Arc::new(AtomicBool::new(false));
        let permit = PassPermit::try_acquire(&gate);
        assert!(permit.is_some());
        assert!(PassPermit::try_acquire(&gate).is_none());

        drop(permit);
        assert!(PassPermit::try_acquire(&gate).is_some());
    }

    #[test]
    fn estimate_checks_both_series() {
        let estimate = Estimate {
            instant: 3000.0,
            average: 3600.0,
        };
        assert!(estimate.fits(500.0, 0.0, 4000.0));
        assert!(!estimate.fits(500.0, 0.0, 3800.0));
        assert!(estimate.fits(500.0, 400.0, 3800.0));
        assert!(estimate.exceeds(3500.0));
        assert!(!estimate.above(0.0, 3200.0));
    }
}
