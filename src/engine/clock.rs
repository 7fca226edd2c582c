//! Scheduler abstraction driving every timer in the engine.
//!
//! Timers carry a typed [`Timer`] payload instead of a callback; the
//! orchestrator pops due timers and dispatches them itself.

use std::collections::BTreeMap;

use chrono::{Local, NaiveDateTime, TimeDelta};

/// What a timer does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    /// Periodic re-evaluation of every consumer.
    GuardTick,
    /// Debounced admission/eviction pass.
    Manage,
    /// Debounced external state report.
    Report,
    /// Run-time limit of the named consumer reached.
    AutoStop(String),
}

/// Disposable handle returned by [`Scheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Source of time and timers for the engine.
///
/// Production uses [`SystemScheduler`]; tests and the household simulation
/// use [`VirtualScheduler`] and advance time explicitly.
pub trait Scheduler {
    /// Current instant.
    fn now(&self) -> NaiveDateTime;

    /// Schedules `timer` to fire after `delay` (negative delays fire immediately).
    fn schedule(&mut self, delay: TimeDelta, timer: Timer) -> TimerHandle;

    /// Cancels a pending timer. Cancelling a fired or unknown handle is a no-op.
    fn cancel(&mut self, handle: TimerHandle);

    /// Due instant of the earliest pending timer.
    fn next_due(&self) -> Option<NaiveDateTime>;

    /// Removes and returns the earliest timer that is due at `now()`.
    fn pop_due(&mut self) -> Option<(TimerHandle, Timer)>;

    /// Moves time forward to `target` (sleeping for real schedulers).
    fn wait_until(&mut self, target: NaiveDateTime);
}

/// Ordered timer storage shared by both scheduler implementations.
#[derive(Debug, Default)]
struct TimerQueue {
    next_id: u64,
    pending: BTreeMap<(NaiveDateTime, u64), Timer>,
}

impl TimerQueue {
    fn insert(&mut self, due: NaiveDateTime, timer: Timer) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert((due, id), timer);
        TimerHandle(id)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.pending.retain(|(_, id), _| *id != handle.0);
    }

    fn next_due(&self) -> Option<NaiveDateTime> {
        self.pending.keys().next().map(|(due, _)| *due)
    }

    fn pop_due(&mut self, now: NaiveDateTime) -> Option<(TimerHandle, Timer)> {
        let key = *self.pending.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.pending
            .remove(&key)
            .map(|timer| (TimerHandle(key.1), timer))
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Deterministic scheduler whose clock only moves when told to.
///
/// # Examples
///
/// ```
/// use chrono::{NaiveDate, TimeDelta};
/// use peak_guard::engine::clock::{Scheduler, Timer, VirtualScheduler};
///
/// let start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
/// let mut scheduler = VirtualScheduler::new(start);
/// scheduler.schedule(TimeDelta::seconds(10), Timer::GuardTick);
///
/// assert!(scheduler.pop_due().is_none());
/// scheduler.wait_until(start + TimeDelta::seconds(10));
/// assert_eq!(scheduler.pop_due().map(|(_, t)| t), Some(Timer::GuardTick));
/// ```
#[derive(Debug)]
pub struct VirtualScheduler {
    now: NaiveDateTime,
    queue: TimerQueue,
}

impl VirtualScheduler {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: start,
            queue: TimerQueue::default(),
        }
    }

    /// Number of timers still pending.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Scheduler for VirtualScheduler {
    fn now(&self) -> NaiveDateTime {
        self.now
    }

    fn schedule(&mut self, delay: TimeDelta, timer: Timer) -> TimerHandle {
        let due = self.now + delay.max(TimeDelta::zero());
        self.queue.insert(due, timer)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.queue.cancel(handle);
    }

    fn next_due(&self) -> Option<NaiveDateTime> {
        self.queue.next_due()
    }

    fn pop_due(&mut self) -> Option<(TimerHandle, Timer)> {
        self.queue.pop_due(self.now)
    }

    fn wait_until(&mut self, target: NaiveDateTime) {
        if target > self.now {
            self.now = target;
        }
    }
}

/// Wall-clock scheduler on local time.
#[derive(Debug, Default)]
pub struct SystemScheduler {
    queue: TimerQueue,
}

impl SystemScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for SystemScheduler {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn schedule(&mut self, delay: TimeDelta, timer: Timer) -> TimerHandle {
        let due = self.now() + delay.max(TimeDelta::zero());
        self.queue.insert(due, timer)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.queue.cancel(handle);
    }

    fn next_due(&self) -> Option<NaiveDateTime> {
        self.queue.next_due()
    }

    fn pop_due(&mut self) -> Option<(TimerHandle, Timer)> {
        let now = self.now();
        self.queue.pop_due(now)
    }

    fn wait_until(&mut self, target: NaiveDateTime) {
        if let Ok(delay) = (target - self.now()).to_std() {
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .expect("valid timestamp")
    }

    #[test]
    fn timers_fire_in_due_order() {
        let mut scheduler = VirtualScheduler::new(start());
        scheduler.schedule(TimeDelta::seconds(20), Timer::Report);
        scheduler.schedule(TimeDelta::seconds(10), Timer::Manage);

        scheduler.wait_until(start() + TimeDelta::seconds(30));
        assert_eq!(scheduler.pop_due().map(|(_, t)| t), Some(Timer::Manage));
        assert_eq!(scheduler.pop_due().map(|(_, t)| t), Some(Timer::Report));
        assert!(scheduler.pop_due().is_none());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut scheduler = VirtualScheduler::new(start());
        let handle = scheduler.schedule(TimeDelta::seconds(5), Timer::AutoStop("fridge".into()));
        scheduler.cancel(handle);

        scheduler.wait_until(start() + TimeDelta::minutes(1));
        assert!(scheduler.pop_due().is_none());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn time_never_moves_backwards() {
        let mut scheduler = VirtualScheduler::new(start());
        scheduler.wait_until(start() - TimeDelta::hours(1));
        assert_eq!(scheduler.now(), start());
    }

    #[test]
    fn zero_delay_is_due_immediately() {
        let mut scheduler = VirtualScheduler::new(start());
        scheduler.schedule(TimeDelta::zero(), Timer::Manage);
        assert_eq!(scheduler.next_due(), Some(start()));
        assert!(scheduler.pop_due().is_some());
    }

    #[test]
    fn system_scheduler_pops_elapsed_timers() {
        let mut scheduler = SystemScheduler::new();
        scheduler.schedule(TimeDelta::milliseconds(-1), Timer::GuardTick);
        assert_eq!(scheduler.pop_due().map(|(_, t)| t), Some(Timer::GuardTick));
    }
}
