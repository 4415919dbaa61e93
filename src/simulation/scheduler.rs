//! Event scheduler for the discrete-event simulation.
//!
//! Events are kept in a binary heap ordered by `(time, sequence)`, so events
//! scheduled for the same instant fire in the order they were scheduled. The
//! scheduler is an ordinary owned value: whoever drives the run passes it by
//! `&mut` into the event handler, which is free to schedule, cancel or stop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::time::Duration;

use super::time::SimTime;

/// Handle returned for every scheduled event, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// An absolute fire time earlier than the current clock was requested.
    InThePast { requested: SimTime, now: SimTime },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::InThePast { requested, now } => {
                write!(f, "cannot schedule an event at {} because the clock is already at {}", requested, now)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug)]
struct ScheduledEvent<E> {
    time: SimTime,
    id: EventId,
    event: E,
}

impl<E> PartialEq for ScheduledEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl<E> Eq for ScheduledEvent<E> {}

impl<E> PartialOrd for ScheduledEvent<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for ScheduledEvent<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse so the earliest (time, seq) pops first.
        match other.time.cmp(&self.time) {
            Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

/// Priority-ordered timeline of events of type `E`.
pub struct Scheduler<E> {
    now: SimTime,
    queue: BinaryHeap<ScheduledEvent<E>>,
    cancelled: HashSet<EventId>,
    next_seq: u64,
    stopped: bool,
    executed: u64,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            queue: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_seq: 0,
            stopped: false,
            executed: 0,
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of events executed so far.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Number of events still waiting (cancelled ones excluded).
    pub fn pending(&self) -> usize {
        self.queue.len() - self.cancelled.len()
    }

    /// Schedule `event` to fire `delay` after the current time.
    pub fn schedule(&mut self, delay: Duration, event: E) -> EventId {
        let time = self.now + delay;
        self.push(time, event)
    }

    /// Schedule `event` at an absolute time, which must not be in the past.
    pub fn schedule_at(&mut self, time: SimTime, event: E) -> Result<EventId, SchedulerError> {
        if time < self.now {
            return Err(SchedulerError::InThePast { requested: time, now: self.now });
        }
        Ok(self.push(time, event))
    }

    fn push(&mut self, time: SimTime, event: E) -> EventId {
        let id = EventId(self.next_seq);
        self.next_seq += 1;
        self.queue.push(ScheduledEvent { time, id, event });
        id
    }

    /// Cancel a pending event. Returns `false` if it already fired, was
    /// already cancelled, or never existed.
    pub fn cancel(&mut self, id: EventId) -> bool {
        if id.0 >= self.next_seq || self.cancelled.contains(&id) {
            return false;
        }
        if !self.queue.iter().any(|scheduled| scheduled.id == id) {
            return false;
        }
        self.cancelled.insert(id)
    }

    /// Stop the current run after the event being processed.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Pop the next live event with fire time `<= until`, advancing the clock.
    pub fn pop_next(&mut self, until: SimTime) -> Option<E> {
        loop {
            let next_time = self.queue.peek()?.time;
            if next_time > until {
                return None;
            }
            let scheduled = self.queue.pop()?;
            if self.cancelled.remove(&scheduled.id) {
                continue;
            }
            if scheduled.time > self.now {
                self.now = scheduled.time;
            }
            self.executed += 1;
            return Some(scheduled.event);
        }
    }

    /// Drain the timeline up to `until`, handing each event to `handler`.
    ///
    /// Returns `true` if the run reached the horizon and `false` if a handler
    /// called [`Scheduler::stop`]. On a complete run the clock ends at `until`.
    pub fn run<F>(&mut self, until: SimTime, mut handler: F) -> bool
    where
        F: FnMut(&mut Scheduler<E>, E),
    {
        self.stopped = false;
        while let Some(event) = self.pop_next(until) {
            handler(self, event);
            if self.stopped {
                return false;
            }
        }
        if until > self.now {
            self.now = until;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_time_order() {
        let mut sched: Scheduler<&str> = Scheduler::new();
        sched.schedule(Duration::from_secs(3), "c");
        sched.schedule(Duration::from_secs(1), "a");
        sched.schedule(Duration::from_secs(2), "b");

        let mut fired = Vec::new();
        assert!(sched.run(SimTime::from_secs(10), |s, e| fired.push((s.now(), e))));
        assert_eq!(
            fired,
            vec![(SimTime::from_secs(1), "a"), (SimTime::from_secs(2), "b"), (SimTime::from_secs(3), "c")]
        );
        assert_eq!(sched.now(), SimTime::from_secs(10));
    }

    #[test]
    fn same_time_events_are_fifo() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        for i in 0..5 {
            sched.schedule(Duration::from_secs(1), i);
        }
        let mut fired = Vec::new();
        sched.run(SimTime::from_secs(1), |_, e| fired.push(e));
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn handler_can_schedule_follow_ups_at_zero_delay() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.schedule(Duration::from_secs(1), 0);
        sched.schedule(Duration::from_secs(1), 1);
        let mut fired = Vec::new();
        sched.run(SimTime::from_secs(5), |s, e| {
            fired.push((s.now(), e));
            if e == 0 {
                // Scheduled after event 1 was inserted, so it must run after it.
                s.schedule(Duration::ZERO, 10);
            }
        });
        assert_eq!(
            fired,
            vec![(SimTime::from_secs(1), 0), (SimTime::from_secs(1), 1), (SimTime::from_secs(1), 10)]
        );
    }

    #[test]
    fn events_beyond_horizon_never_run() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.schedule(Duration::from_secs(1), 1);
        sched.schedule(Duration::from_secs(8), 8);
        let mut fired = Vec::new();
        sched.run(SimTime::from_secs(7), |_, e| fired.push(e));
        assert_eq!(fired, vec![1]);
        assert_eq!(sched.pending(), 1);
        assert_eq!(sched.now(), SimTime::from_secs(7));
    }

    #[test]
    fn stop_truncates_run() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        for i in 1..=4 {
            sched.schedule(Duration::from_secs(i as u64), i);
        }
        let mut fired = Vec::new();
        let completed = sched.run(SimTime::from_secs(10), |s, e| {
            fired.push(e);
            if e == 2 {
                s.stop();
            }
        });
        assert!(!completed);
        assert_eq!(fired, vec![1, 2]);
        assert_eq!(sched.now(), SimTime::from_secs(2));
        assert_eq!(sched.pending(), 2);
    }

    #[test]
    fn cancelled_events_are_skipped() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        let a = sched.schedule(Duration::from_secs(1), 1);
        let b = sched.schedule(Duration::from_secs(2), 2);
        assert!(sched.cancel(b));
        assert!(!sched.cancel(b), "double cancel must report false");
        assert_eq!(sched.pending(), 1);

        let mut fired = Vec::new();
        sched.run(SimTime::from_secs(5), |_, e| fired.push(e));
        assert_eq!(fired, vec![1]);
        assert!(!sched.cancel(a), "fired events cannot be cancelled");
    }

    #[test]
    fn schedule_at_rejects_past_times() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.schedule(Duration::from_secs(2), 0);
        sched.run(SimTime::from_secs(2), |_, _| {});
        let err = sched.schedule_at(SimTime::from_secs(1), 1).unwrap_err();
        assert_eq!(
            err,
            SchedulerError::InThePast {
                requested: SimTime::from_secs(1),
                now: SimTime::from_secs(2)
            }
        );
        assert!(sched.schedule_at(SimTime::from_secs(2), 2).is_ok());
    }
}
