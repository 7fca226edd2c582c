//! Controllable loads and their admission lifecycle.
//!
//! A [`Consumer`] pairs the shared [`ConsumerBase`] bookkeeping with one
//! [`ConsumerKind`] variant. The engine only uses the capability methods on
//! `Consumer` and, for adjustable loads, the [`DynamicLoad`] trait.

mod base;
pub mod car_charger;
pub mod cooling;
pub mod simple;
pub mod triggered;

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

pub use base::{Actuation, ConsumerBase, ConsumerSettings, PENDING_ACTUATION_TIMEOUT_SECS};
pub use car_charger::{CarChargerConsumer, CarChargerEntities};
pub use cooling::CoolingConsumer;
pub use simple::SimpleConsumer;
pub use triggered::TriggeredConsumer;

use crate::engine::clock::TimerHandle;
use crate::entity::{Command, EntityEvent, EntityId, Inbox};

/// Consumer states, ordered by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ConsumerState {
    #[default]
    Unknown,
    Off,
    Running,
    RunOnSolarExcess,
    NeedsEnergy,
    CriticallyNeedsEnergy,
}

impl ConsumerState {
    /// Running in any mode.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::RunOnSolarExcess)
    }

    /// Waiting to be admitted.
    pub fn wants_start(self) -> bool {
        matches!(self, Self::NeedsEnergy | Self::CriticallyNeedsEnergy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Off => "Off",
            Self::Running => "Running",
            Self::RunOnSolarExcess => "RunOnSolarExcess",
            Self::NeedsEnergy => "NeedsEnergy",
            Self::CriticallyNeedsEnergy => "CriticallyNeedsEnergy",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(Self::Unknown),
            "Off" => Ok(Self::Off),
            "Running" => Ok(Self::Running),
            "RunOnSolarExcess" => Ok(Self::RunOnSolarExcess),
            "NeedsEnergy" => Ok(Self::NeedsEnergy),
            "CriticallyNeedsEnergy" => Ok(Self::CriticallyNeedsEnergy),
            other => Err(format!("unknown consumer state \"{other}\"")),
        }
    }
}

/// How a dynamic load chooses its target grid load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalancingMethod {
    /// Only absorb surplus: target a net load of zero.
    #[default]
    SolarOnly,
    /// Fill up to half of the contracted peak.
    MidPeak,
    /// Fill up to [`NEAR_PEAK_MARGIN_W`] below the contracted peak.
    NearPeak,
    /// Fill up to the contracted peak.
    MaxPeak,
}

/// Safety margin kept by [`BalancingMethod::NearPeak`] (W).
pub const NEAR_PEAK_MARGIN_W: f64 = 500.0;

impl BalancingMethod {
    /// Parses a stored or configured method name; anything unrecognised falls
    /// back to the most conservative method.
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "solar_only" | "solaronly" => Self::SolarOnly,
            "mid_peak" | "midpeak" => Self::MidPeak,
            "near_peak" | "nearpeak" => Self::NearPeak,
            "max_peak" | "maxpeak" => Self::MaxPeak,
            other => {
                tracing::warn!(method = other, "unknown balancing method, using solar_only");
                Self::SolarOnly
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SolarOnly => "solar_only",
            Self::MidPeak => "mid_peak",
            Self::NearPeak => "near_peak",
            Self::MaxPeak => "max_peak",
        }
    }

    /// Net grid load this method steers towards, given the contracted peak.
    pub fn target_load(self, peak_load: f64) -> f64 {
        match self {
            Self::SolarOnly => 0.0,
            Self::MidPeak => peak_load / 2.0,
            Self::NearPeak => (peak_load - NEAR_PEAK_MARGIN_W).max(0.0),
            Self::MaxPeak => peak_load,
        }
    }
}

/// Group name matching every consumer.
pub const ALL_GROUPS: &str = "all";

/// Result of a [`DynamicLoad::rebalance`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Rebalanced {
    /// Actual change in draw (W); may be smaller than requested at the clamps.
    pub realized_w: f64,
    pub command: Option<Command>,
}

/// A consumer whose draw can be adjusted continuously.
pub trait DynamicLoad {
    fn min_current(&self) -> f64;
    fn max_current(&self) -> f64;
    /// Current set-point (A).
    fn current(&self) -> f64;
    fn voltage(&self) -> f64;
    /// Power that throttling to the minimum current would free (W).
    fn releasable_power(&self) -> f64;
    fn balancing_method(&self) -> BalancingMethod;
    fn set_balancing_method(&mut self, method: BalancingMethod);
    /// Group this load volunteers to throttle for, if any.
    fn balance_on_behalf_of(&self) -> Option<&str>;
    /// Whether the home battery may discharge while this load runs.
    fn allows_battery_power(&self) -> bool;
    /// Nudges the draw to absorb `net_grid_usage` watts (negative = surplus).
    fn rebalance(&mut self, net_grid_usage: f64) -> Rebalanced;
}

/// Per-variant behaviour.
pub trait Behavior {
    fn watches(&self, entity: &EntityId) -> bool;
    fn observe(&mut self, event: &EntityEvent);
    /// Actuation observed as active.
    fn is_running(&self) -> bool;
    fn desired_state(&self, base: &ConsumerBase, now: NaiveDateTime) -> ConsumerState;

    fn peak_load(&self, base: &ConsumerBase) -> f64 {
        base.settings().peak_load
    }

    fn current_load(&self, base: &ConsumerBase) -> f64 {
        base.power_w().unwrap_or_else(|| {
            if self.is_running() {
                self.peak_load(base)
            } else {
                0.0
            }
        })
    }

    fn allows_force_stop(&self) -> bool {
        true
    }

    fn allows_force_stop_on_peak_load(&self) -> bool {
        true
    }

    fn turn_on(&mut self) -> Vec<Command>;
    fn turn_off(&mut self) -> Vec<Command>;
}

#[derive(Debug)]
pub enum ConsumerKind {
    Simple(SimpleConsumer),
    Cooling(CoolingConsumer),
    Triggered(TriggeredConsumer),
    CarCharger(CarChargerConsumer),
}

impl ConsumerKind {
    fn behavior(&self) -> &dyn Behavior {
        match self {
            Self::Simple(c) => c,
            Self::Cooling(c) => c,
            Self::Triggered(c) => c,
            Self::CarCharger(c) => c,
        }
    }

    fn behavior_mut(&mut self) -> &mut dyn Behavior {
        match self {
            Self::Simple(c) => c,
            Self::Cooling(c) => c,
            Self::Triggered(c) => c,
            Self::CarCharger(c) => c,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Simple(_) => "simple",
            Self::Cooling(_) => "cooling",
            Self::Triggered(_) => "triggered",
            Self::CarCharger(_) => "car_charger",
        }
    }
}

/// Lifecycle notifications produced by [`Consumer::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// Actuation confirmed on.
    Started,
    /// Actuation confirmed off.
    Stopped,
    /// Desired state moved to Needs/Critical.
    StartRequested,
    /// Desired state moved to Off while still running.
    StopRequested,
}

/// Persisted part of a consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSnapshot {
    pub state: String,
    pub started_at: Option<NaiveDateTime>,
    pub last_run: Option<NaiveDateTime>,
    #[serde(default)]
    pub balancing_method: Option<String>,
}

#[derive(Debug)]
pub struct Consumer {
    base: ConsumerBase,
    kind: ConsumerKind,
    inbox: Inbox,
}

impl Consumer {
    pub fn new(name: impl Into<String>, settings: ConsumerSettings, kind: ConsumerKind) -> Self {
        Self {
            base: ConsumerBase::new(name.into(), settings),
            kind,
            inbox: Inbox::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }

    pub fn kind(&self) -> &ConsumerKind {
        &self.kind
    }

    pub fn base(&self) -> &ConsumerBase {
        &self.base
    }

    pub fn state(&self) -> ConsumerState {
        self.base.state
    }

    pub fn started_at(&self) -> Option<NaiveDateTime> {
        self.base.started_at
    }

    pub fn last_run(&self) -> Option<NaiveDateTime> {
        self.base.last_run
    }

    pub fn groups(&self) -> &[String] {
        &self.base.settings.groups
    }

    pub fn switch_on_load(&self) -> f64 {
        self.base.settings.switch_on_load
    }

    pub fn switch_off_load(&self) -> f64 {
        self.base.settings.switch_off_load
    }

    pub fn watches(&self, entity: &EntityId) -> bool {
        self.base.watches(entity) || self.kind.behavior().watches(entity)
    }

    /// Queues `event` if this consumer reads the entity.
    pub fn deliver(&mut self, event: &EntityEvent) -> bool {
        if self.inbox.is_closed() || !self.watches(&event.entity) {
            return false;
        }
        self.inbox.push(event.clone());
        true
    }

    /// Drains the inbox into the cached sensor values and re-evaluates.
    pub fn process(&mut self, now: NaiveDateTime) -> Vec<ConsumerEvent> {
        let events: Vec<EntityEvent> = self.inbox.drain().collect();
        for event in &events {
            self.base.observe(event);
            self.kind.behavior_mut().observe(event);
        }
        self.evaluate(now)
    }

    /// Detects confirmed starts/stops and recomputes the desired state.
    pub fn evaluate(&mut self, now: NaiveDateTime) -> Vec<ConsumerEvent> {
        if self.inbox.is_closed() {
            return Vec::new();
        }

        let mut events = Vec::new();
        let running = self.kind.behavior().is_running();

        if running != self.base.physically_running {
            self.base.physically_running = running;
            self.base.pending = None;
            self.base.planned_stop = None;
            if running {
                // a restored start time survives a restart
                self.base.started_at.get_or_insert(now);
                self.base.last_run = None;
                events.push(ConsumerEvent::Started);
            } else {
                self.base.started_at = None;
                self.base.last_run = Some(now);
                events.push(ConsumerEvent::Stopped);
            }
        } else if !running && self.base.started_at.is_some() {
            // restored run that ended while nobody was watching
            self.base.started_at = None;
            self.base.last_run = Some(now);
        }

        let desired = self.kind.behavior().desired_state(&self.base, now);
        if desired != self.base.state {
            tracing::debug!(
                consumer = %self.base.name,
                from = %self.base.state,
                to = %desired,
                "consumer state changed"
            );
            self.base.state = desired;
            if desired.wants_start() {
                events.push(ConsumerEvent::StartRequested);
            } else if desired == ConsumerState::Off && running {
                events.push(ConsumerEvent::StopRequested);
            }
        }

        events
    }

    /// Actuation observed as active.
    pub fn is_running(&self) -> bool {
        self.base.physically_running
    }

    pub fn pending(&self, now: NaiveDateTime) -> Option<Actuation> {
        self.base.pending(now)
    }

    pub fn peak_load(&self) -> f64 {
        self.kind.behavior().peak_load(&self.base)
    }

    /// Current draw (W).
    pub fn current_load(&self) -> f64 {
        self.kind.behavior().current_load(&self.base)
    }

    pub fn critical_condition(&self, now: NaiveDateTime) -> bool {
        self.base.critical_condition(now)
    }

    pub fn can_start(&self, now: NaiveDateTime) -> bool {
        if !self.base.state.wants_start() {
            return false;
        }
        if self.base.pending(now) == Some(Actuation::Start) {
            return false;
        }
        self.base.in_time_window(now) && self.base.min_timeout_elapsed(now)
    }

    pub fn can_force_stop(&self, now: NaiveDateTime) -> bool {
        self.base.min_runtime_elapsed(now)
            && !self.base.critical_condition(now)
            && self.kind.behavior().allows_force_stop()
    }

    pub fn can_force_stop_on_peak_load(&self, now: NaiveDateTime) -> bool {
        self.base.min_runtime_elapsed(now) && self.kind.behavior().allows_force_stop_on_peak_load()
    }

    pub fn run_time(&mut self, now: NaiveDateTime) -> Option<TimeDelta> {
        self.base.run_time(now)
    }

    /// Requests actuation on. No-op while a start is already pending.
    pub fn turn_on(&mut self, now: NaiveDateTime) -> Vec<Command> {
        if self.base.pending(now) == Some(Actuation::Start) {
            return Vec::new();
        }
        self.base.pending = Some((Actuation::Start, now));
        self.kind.behavior_mut().turn_on()
    }

    /// Requests actuation off. No-op while a stop is pending or when not running.
    pub fn turn_off(&mut self, now: NaiveDateTime) -> Vec<Command> {
        if self.base.pending(now) == Some(Actuation::Stop) || !self.base.physically_running {
            return Vec::new();
        }
        self.base.pending = Some((Actuation::Stop, now));
        self.kind.behavior_mut().turn_off()
    }

    pub fn set_stop_timer(&mut self, handle: TimerHandle) -> Option<TimerHandle> {
        self.base.stop_timer.replace(handle)
    }

    pub fn take_stop_timer(&mut self) -> Option<TimerHandle> {
        self.base.stop_timer.take()
    }

    /// Pending auto-stop timer, if any.
    pub fn stop_timer(&self) -> Option<TimerHandle> {
        self.base.stop_timer
    }

    pub fn dynamic(&self) -> Option<&dyn DynamicLoad> {
        match &self.kind {
            ConsumerKind::CarCharger(c) => Some(c),
            _ => None,
        }
    }

    pub fn dynamic_mut(&mut self) -> Option<&mut dyn DynamicLoad> {
        match &mut self.kind {
            ConsumerKind::CarCharger(c) => Some(c),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            state: self.base.state.to_string(),
            started_at: self.base.started_at,
            last_run: self.base.last_run,
            balancing_method: self.dynamic().map(|d| d.balancing_method().as_str().to_string()),
        }
    }

    /// Restores timestamps and the balancing method. The state itself is
    /// always recomputed from live sensors.
    pub fn restore(&mut self, snapshot: ConsumerSnapshot) {
        if snapshot.state.parse::<ConsumerState>().is_err() {
            tracing::warn!(
                consumer = %self.base.name,
                state = %snapshot.state,
                "ignoring unknown stored state"
            );
        }
        self.base.started_at = snapshot.started_at;
        self.base.last_run = if snapshot.started_at.is_some() {
            None
        } else {
            snapshot.last_run
        };
        if let (Some(method), Some(dynamic)) = (snapshot.balancing_method, self.dynamic_mut()) {
            dynamic.set_balancing_method(BalancingMethod::parse_or_default(&method));
        }
    }

    /// Closes the inbox and hands back the pending auto-stop timer.
    pub fn dispose(&mut self) -> Option<TimerHandle> {
        self.inbox.close();
        self.base.stop_timer.take()
    }
}
