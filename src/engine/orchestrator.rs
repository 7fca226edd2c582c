//! The orchestrator owns every consumer, battery and the capacity monitor,
//! reacts to sensor events and drives all timers.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{NaiveDateTime, TimeDelta};

use super::clock::{Scheduler, Timer, TimerHandle};
use super::monitor::CapacityMonitor;
use super::types::EngineSettings;
use crate::config::{ConfigError, InstallationConfig};
use crate::devices::{
    Battery, BatterySnapshot, Consumer, ConsumerEvent, ConsumerSnapshot, ConsumerState,
};
use crate::entity::{Command, EntityEvent};
use crate::report::{NullSink, ReportSink, StateReport};
use crate::store::{
    BATTERY_NAMESPACE, CONSUMER_NAMESPACE, MemoryStore, StateStore, StateStoreExt, StoreError,
};

/// Single owner of all mutable engine state.
///
/// Generic over `S: Scheduler` so tests and the household simulation can run
/// on virtual time. Hosts feed sensor changes through [`publish`](Self::publish),
/// drive time with [`run_until`](Self::run_until) and drain actuation requests
/// with [`take_commands`](Self::take_commands).
pub struct Orchestrator<S: Scheduler> {
    pub(super) settings: EngineSettings,
    pub(super) scheduler: S,
    pub(super) monitor: CapacityMonitor,
    pub(super) consumers: Vec<Consumer>,
    pub(super) batteries: Vec<Battery>,
    pub(super) outbox: Vec<Command>,
    pub(super) gate: Arc<AtomicBool>,
    pub(super) last_change: Option<NaiveDateTime>,
    store: Box<dyn StateStore>,
    sink: Box<dyn ReportSink>,
    guard_timer: Option<TimerHandle>,
    manage_timer: Option<TimerHandle>,
    report_timer: Option<TimerHandle>,
    started: bool,
}

impl<S: Scheduler> Orchestrator<S> {
    /// Creates an orchestrator with no consumers, an in-memory store and a
    /// sink that discards reports.
    pub fn new(settings: EngineSettings, scheduler: S, monitor: CapacityMonitor) -> Self {
        Self {
            settings,
            scheduler,
            monitor,
            consumers: Vec::new(),
            batteries: Vec::new(),
            outbox: Vec::new(),
            gate: Arc::new(AtomicBool::new(false)),
            last_change: None,
            store: Box::new(MemoryStore::new()),
            sink: Box::new(NullSink),
            guard_timer: None,
            manage_timer: None,
            report_timer: None,
            started: false,
        }
    }

    /// Builds an orchestrator from a validated installation config.
    ///
    /// # Errors
    ///
    /// Returns every validation error found in `config`.
    pub fn from_config(
        config: &InstallationConfig,
        scheduler: S,
    ) -> Result<Self, Vec<ConfigError>> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(errors);
        }

        let consumers = config.build_consumers().map_err(|e| vec![e])?;
        let monitor = CapacityMonitor::new(config.grid.entities(), config.engine.history_capacity);
        let mut orchestrator = Self::new(config.engine.settings(), scheduler, monitor);
        for consumer in consumers {
            orchestrator = orchestrator.with_consumer(consumer);
        }
        for battery in &config.batteries {
            orchestrator = orchestrator.with_battery(battery.build());
        }
        Ok(orchestrator)
    }

    /// Adds a consumer. List order is admission order within a priority class.
    pub fn with_consumer(mut self, consumer: Consumer) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn with_battery(mut self, battery: Battery) -> Self {
        self.batteries.push(battery);
        self
    }

    pub fn with_store(mut self, store: impl StateStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Restores persisted state, evaluates every consumer and arms the guard
    /// timer. Events published before `start` are queued, not evaluated.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.restore();

        let now = self.scheduler.now();
        tracing::info!(
            consumers = self.consumers.len(),
            batteries = self.batteries.len(),
            %now,
            "orchestrator started"
        );
        // every consumer knows its state before the first pass can run
        let evaluated: Vec<_> = (0..self.consumers.len())
            .map(|index| {
                let before = self.consumers[index].state();
                (index, before, self.consumers[index].process(now))
            })
            .collect();
        for (index, before, events) in evaluated {
            self.handle_consumer_events(index, before, events, now);
        }

        self.guard_timer = Some(
            self.scheduler
                .schedule(self.settings.guard_interval, Timer::GuardTick),
        );
        self.request_manage();
        self.request_report();
    }

    fn restore(&mut self) {
        for consumer in &mut self.consumers {
            if let Some(snapshot) = self
                .store
                .get::<ConsumerSnapshot>(CONSUMER_NAMESPACE, consumer.name())
            {
                tracing::debug!(
                    consumer = consumer.name(),
                    state = %snapshot.state,
                    "restoring consumer"
                );
                consumer.restore(snapshot);
            }
        }
        for battery in &mut self.batteries {
            if let Some(snapshot) = self
                .store
                .get::<BatterySnapshot>(BATTERY_NAMESPACE, battery.name())
            {
                battery.restore(snapshot);
            }
        }
    }

    /// Feeds one sensor change to every component that reads it.
    pub fn publish(&mut self, event: EntityEvent) {
        let now = self.scheduler.now();

        if self.monitor.watches(&event.entity) {
            self.monitor.observe(&event, now);
            if self.started && !self.monitor.within_peak() {
                tracing::debug!(
                    load = self.monitor.current_load(),
                    peak = self.monitor.peak_load(),
                    "load above peak"
                );
                self.request_manage();
            }
        }

        for battery in &mut self.batteries {
            if battery.watches(&event.entity) {
                battery.observe(&event);
            }
        }

        for index in 0..self.consumers.len() {
            if !self.consumers[index].deliver(&event) || !self.started {
                continue;
            }
            let before = self.consumers[index].state();
            let events = self.consumers[index].process(now);
            self.handle_consumer_events(index, before, events, now);
        }
    }

    fn handle_consumer_events(
        &mut self,
        index: usize,
        before: ConsumerState,
        events: Vec<ConsumerEvent>,
        now: NaiveDateTime,
    ) {
        for event in events {
            match event {
                ConsumerEvent::Started => {
                    tracing::info!(consumer = self.consumers[index].name(), "consumer started");
                    self.arm_auto_stop(index, now);
                }
                ConsumerEvent::Stopped => {
                    tracing::info!(consumer = self.consumers[index].name(), "consumer stopped");
                    if let Some(handle) = self.consumers[index].take_stop_timer() {
                        self.scheduler.cancel(handle);
                    }
                    self.request_manage();
                }
                ConsumerEvent::StartRequested => self.request_manage(),
                ConsumerEvent::StopRequested => {
                    self.stop_at(index, now);
                }
            }
        }

        if self.consumers[index].state() != before {
            self.request_report();
        }
    }

    fn arm_auto_stop(&mut self, index: usize, now: NaiveDateTime) {
        let Some(run_time) = self.consumers[index].run_time(now) else {
            return;
        };
        let name = self.consumers[index].name().to_string();
        tracing::debug!(consumer = %name, seconds = run_time.num_seconds(), "auto-stop armed");
        let handle = self.scheduler.schedule(run_time, Timer::AutoStop(name));
        if let Some(previous) = self.consumers[index].set_stop_timer(handle) {
            self.scheduler.cancel(previous);
        }
    }

    /// Requests actuation on for the consumer at `index`.
    pub(super) fn start_at(&mut self, index: usize, now: NaiveDateTime) -> bool {
        let commands = self.consumers[index].turn_on(now);
        if commands.is_empty() {
            return false;
        }
        self.outbox.extend(commands);
        true
    }

    /// Stops the consumer at `index` and disposes its auto-stop timer.
    /// Returns `false` when a stop was already pending or it is not running.
    pub(super) fn stop_at(&mut self, index: usize, now: NaiveDateTime) -> bool {
        if let Some(handle) = self.consumers[index].take_stop_timer() {
            self.scheduler.cancel(handle);
        }
        let commands = self.consumers[index].turn_off(now);
        if commands.is_empty() {
            return false;
        }
        tracing::info!(consumer = self.consumers[index].name(), "stopping consumer");
        self.outbox.extend(commands);
        true
    }

    /// Stops a consumer by name. Repeated calls produce a single command.
    pub fn stop_consumer(&mut self, name: &str) -> bool {
        let now = self.scheduler.now();
        match self.index_of(name) {
            Some(index) => self.stop_at(index, now),
            None => {
                tracing::warn!(consumer = name, "stop requested for unknown consumer");
                false
            }
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.consumers.iter().position(|c| c.name() == name)
    }

    /// Schedules an admission pass, or runs it now when debouncing is off.
    pub fn request_manage(&mut self) {
        if self.settings.manage_debounce <= TimeDelta::zero() {
            self.manage();
        } else if self.manage_timer.is_none() {
            self.manage_timer = Some(
                self.scheduler
                    .schedule(self.settings.manage_debounce, Timer::Manage),
            );
        }
    }

    /// Schedules a state report, or publishes one now when debouncing is off.
    pub fn request_report(&mut self) {
        if self.settings.report_debounce <= TimeDelta::zero() {
            self.report();
        } else if self.report_timer.is_none() {
            self.report_timer = Some(
                self.scheduler
                    .schedule(self.settings.report_debounce, Timer::Report),
            );
        }
    }

    /// Fires every timer that is due at the scheduler's current time.
    pub fn run_pending(&mut self) {
        while let Some((handle, timer)) = self.scheduler.pop_due() {
            self.fire(handle, timer);
        }
    }

    /// Runs timers in due order until `target`, then moves time to `target`.
    pub fn run_until(&mut self, target: NaiveDateTime) {
        while let Some(due) = self.scheduler.next_due() {
            if due > target {
                break;
            }
            self.scheduler.wait_until(due);
            self.run_pending();
        }
        self.scheduler.wait_until(target);
        self.run_pending();
    }

    pub fn advance(&mut self, delta: TimeDelta) {
        let target = self.scheduler.now() + delta;
        self.run_until(target);
    }

    fn fire(&mut self, handle: TimerHandle, timer: Timer) {
        match timer {
            Timer::GuardTick => {
                self.guard_timer = Some(
                    self.scheduler
                        .schedule(self.settings.guard_interval, Timer::GuardTick),
                );
                self.guard_tick();
            }
            Timer::Manage => {
                self.manage_timer = None;
                self.manage();
            }
            Timer::Report => {
                self.report_timer = None;
                self.report();
            }
            Timer::AutoStop(name) => {
                let Some(index) = self.index_of(&name) else {
                    return;
                };
                if self.consumers[index].stop_timer() != Some(handle) {
                    return;
                }
                tracing::info!(consumer = %name, "run time elapsed");
                let now = self.scheduler.now();
                self.stop_at(index, now);
            }
        }
    }

    fn guard_tick(&mut self) {
        let now = self.scheduler.now();
        for index in 0..self.consumers.len() {
            let before = self.consumers[index].state();
            let events = self.consumers[index].evaluate(now);
            self.handle_consumer_events(index, before, events, now);
        }
        self.request_manage();
    }

    /// Publishes a state report and persists snapshots. Failures are logged.
    pub fn report(&mut self) {
        let report = self.state_report();
        if let Err(e) = self.sink.publish(&report) {
            tracing::warn!(error = %e, "state report dropped");
        }
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "state snapshot not saved");
        }
    }

    pub fn state_report(&self) -> StateReport {
        StateReport::new(
            self.scheduler.now(),
            self.state(),
            self.consumers
                .iter()
                .map(|c| (c.name(), c.state(), c.started_at(), c.last_run())),
        )
    }

    /// Writes every consumer and battery snapshot to the store.
    ///
    /// # Errors
    ///
    /// Returns the first store failure; later records are not attempted.
    pub fn persist(&mut self) -> Result<(), StoreError> {
        for consumer in &self.consumers {
            self.store
                .save(CONSUMER_NAMESPACE, consumer.name(), &consumer.snapshot())?;
        }
        for battery in &self.batteries {
            self.store
                .save(BATTERY_NAMESPACE, battery.name(), &battery.snapshot())?;
        }
        Ok(())
    }

    /// Persists state, disposes every consumer and cancels all timers.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "state snapshot not saved on shutdown");
        }
        for consumer in &mut self.consumers {
            if let Some(handle) = consumer.dispose() {
                self.scheduler.cancel(handle);
            }
        }
        for handle in [
            self.guard_timer.take(),
            self.manage_timer.take(),
            self.report_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.scheduler.cancel(handle);
        }
        self.started = false;
        tracing::info!("orchestrator shut down");
    }

    /// Drains actuation requests produced since the last call.
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.outbox)
    }

    /// Most urgent state among all consumers.
    pub fn state(&self) -> ConsumerState {
        self.consumers
            .iter()
            .map(Consumer::state)
            .max()
            .unwrap_or(ConsumerState::Off)
    }

    pub fn consumer(&self, name: &str) -> Option<&Consumer> {
        self.consumers.iter().find(|c| c.name() == name)
    }

    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    pub fn batteries(&self) -> &[Battery] {
        &self.batteries
    }

    pub fn monitor(&self) -> &CapacityMonitor {
        &self.monitor
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now(&self) -> NaiveDateTime {
        self.scheduler.now()
    }

    /// Instant of the last pass that changed anything.
    pub fn last_change(&self) -> Option<NaiveDateTime> {
        self.last_change
    }

    /// Flag held while a pass runs. A caller holding it set makes
    /// [`manage`](Self::manage) skip.
    ///
    /// Hosts that change consumers from outside a pass (manual overrides,
    /// config reloads) set it for the duration of that change so no pass
    /// plans against half-applied state, and clear it afterwards.
    pub fn pass_gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.gate)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}
