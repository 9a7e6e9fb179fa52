//! Overview of retrace scheduling:
//!
//! Many traced tasks are multiplexed onto one strictly serialized virtual
//! timeline: at most one task is logically running at a time. The scheduler
//! decides, at each event, which task runs next and for how long, and it
//! must make the same decisions during recording and replay. To that end
//! every choice is a pure function of state that is itself recorded --
//! the set of live tids, tick counts and event counts -- and never of
//! wall-clock time or host scheduler behavior.
//!
//! The current task keeps running until its timeslice is exhausted or it
//! exits. A timeslice is a (max_ticks, max_events) budget; exhausting either
//! bound expires the slice. Expiry is always materialized as a SCHED frame
//! in the trace, so during replay the recorded SCHED frames drive slice
//! expiry through the same `expire_slice` entry point and the rotation
//! sequence is identical by construction.
//!
//! When rotating, the next runnable task in ascending-tid order after the
//! current one is chosen, wrapping around; tasks that become runnable
//! simultaneously are therefore always tried in a total order fixed at task
//! creation, never in host wake-up order (which is not reproducible).
//!
//! One Scheduler instance is consumed by both the recorder and the
//! replayer. There is deliberately no second copy of this policy anywhere.

use crate::ticks::Ticks;
use libc::pid_t;
use std::collections::BTreeSet;
use std::ops::Bound::{Excluded, Unbounded};

pub struct Scheduler {
    /// Live, schedulable tasks in ascending tid order.
    runnable: BTreeSet<pid_t>,
    current: Option<pid_t>,

    max_ticks: Ticks,
    max_events: u64,

    /// Consumption within the current slice.
    slice_ticks: Ticks,
    slice_events: u64,
    slice_expired: bool,
}

impl Scheduler {
    pub fn new(max_ticks: Ticks, max_events: u64) -> Scheduler {
        Scheduler {
            runnable: BTreeSet::new(),
            current: None,
            max_ticks: max_ticks.max(1),
            max_events: max_events.max(1),
            slice_ticks: 0,
            slice_events: 0,
            slice_expired: false,
        }
    }

    pub fn on_task_created(&mut self, tid: pid_t) {
        self.runnable.insert(tid);
    }

    pub fn on_task_exited(&mut self, tid: pid_t) {
        self.runnable.remove(&tid);
        if self.current == Some(tid) {
            self.current = None;
            self.reset_slice();
        }
    }

    pub fn current(&self) -> Option<pid_t> {
        self.current
    }

    /// Ticks left in the current slice; used to arm the tick interrupt.
    pub fn remaining_ticks(&self) -> Ticks {
        self.max_ticks.saturating_sub(self.slice_ticks).max(1)
    }

    /// Pick the task to run next. Keeps the current task until its slice
    /// expires or it goes away, then rotates in tid order.
    pub fn next_task(&mut self) -> Option<pid_t> {
        if self.runnable.is_empty() {
            return None;
        }
        if let Some(tid) = self.current {
            if !self.slice_expired && self.runnable.contains(&tid) {
                return Some(tid);
            }
        }
        let next = self
            .current
            .and_then(|c| self.runnable.range((Excluded(c), Unbounded)).next().copied())
            .or_else(|| self.runnable.iter().next().copied());
        self.current = next;
        self.reset_slice();
        next
    }

    /// Account one event and `ticks_delta` ticks against the current slice.
    /// Returns true once the slice budget is exhausted. The verdict never
    /// rotates by itself: only `expire_slice` does, which the recorder calls
    /// when it emits the SCHED frame and the replayer calls when it consumes
    /// one. Rotation therefore lands on the identical frame on both sides,
    /// even when their per-slice event counts drift (ignored signals are
    /// counted at record but leave no frame).
    pub fn note_event(&mut self, ticks_delta: Ticks) -> bool {
        self.slice_ticks = self.slice_ticks.saturating_add(ticks_delta);
        self.slice_events += 1;
        self.slice_ticks >= self.max_ticks || self.slice_events >= self.max_events
    }

    /// Force the current slice to end; the next `next_task` call rotates.
    pub fn expire_slice(&mut self) {
        self.slice_expired = true;
    }

    fn reset_slice(&mut self) {
        self.slice_ticks = 0;
        self.slice_events = 0;
        self.slice_expired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_task_keeps_running() {
        let mut s = Scheduler::new(1000, 10);
        s.on_task_created(100);
        assert_eq!(Some(100), s.next_task());
        assert!(!s.note_event(1));
        assert_eq!(Some(100), s.next_task());
    }

    #[test]
    fn rotation_follows_tid_order_not_insertion_order() {
        let mut s = Scheduler::new(1000, 10);
        // Insertion order deliberately scrambled.
        s.on_task_created(300);
        s.on_task_created(100);
        s.on_task_created(200);
        assert_eq!(Some(100), s.next_task());
        s.expire_slice();
        assert_eq!(Some(200), s.next_task());
        s.expire_slice();
        assert_eq!(Some(300), s.next_task());
        s.expire_slice();
        // Wraps around.
        assert_eq!(Some(100), s.next_task());
    }

    #[test]
    fn event_budget_bounds_slice_length() {
        let max_events = 5;
        let mut s = Scheduler::new(u64::max_value(), max_events);
        s.on_task_created(1);
        s.next_task();
        let mut events_in_slice = 0;
        loop {
            events_in_slice += 1;
            if s.note_event(1) {
                break;
            }
            assert!(events_in_slice < max_events);
        }
        assert_eq!(max_events, events_in_slice);
    }

    #[test]
    fn tick_budget_expires_slice() {
        let mut s = Scheduler::new(100, 1000);
        s.on_task_created(1);
        s.on_task_created(2);
        s.next_task();
        assert!(!s.note_event(99));
        assert!(s.note_event(1));
        s.expire_slice();
        assert_eq!(Some(2), s.next_task());
    }

    #[test]
    fn exhausted_budget_rotates_only_after_expire_slice() {
        let mut s = Scheduler::new(1000, 1);
        s.on_task_created(1);
        s.on_task_created(2);
        assert_eq!(Some(1), s.next_task());
        assert!(s.note_event(1));
        // The verdict alone must not reschedule; the SCHED frame marking
        // the rotation point has not been written or consumed yet.
        assert_eq!(Some(1), s.next_task());
        s.expire_slice();
        assert_eq!(Some(2), s.next_task());
    }

    #[test]
    fn exited_current_task_is_replaced() {
        let mut s = Scheduler::new(1000, 10);
        s.on_task_created(5);
        s.on_task_created(6);
        assert_eq!(Some(5), s.next_task());
        s.on_task_exited(5);
        assert_eq!(Some(6), s.next_task());
        s.on_task_exited(6);
        assert_eq!(None, s.next_task());
    }

    #[test]
    fn same_inputs_give_same_schedule() {
        let run = || {
            let mut s = Scheduler::new(50, 4);
            let mut schedule = Vec::new();
            s.on_task_created(10);
            s.on_task_created(20);
            for i in 0..40u64 {
                let tid = s.next_task().unwrap();
                schedule.push(tid);
                if s.note_event(7 + (i % 3)) {
                    s.expire_slice();
                }
            }
            schedule
        };
        assert_eq!(run(), run());
    }
}
