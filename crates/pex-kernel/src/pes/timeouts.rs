//! Timer queue
//!
//! Context switchers never spin on the switching agent. They arm a timer and
//! the kernel's work loop re-invokes them once it expires.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::types::PeId;

/// Handle of an armed timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// What to do when a timer expires
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// Poll the switching agent of a PE again
    SwitchPoll(PeId),
    /// The time slice on a PE is used up
    TimeSlice(PeId),
}

#[derive(Debug, Default)]
pub struct Timeouts {
    next_id: u64,
    queue: BTreeMap<(u64, TimerId), TimerEvent>,
}

impl Timeouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `event` at time `deadline`
    pub fn add(&mut self, deadline: u64, event: TimerEvent) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.queue.insert((deadline, id), event);
        id
    }

    /// Disarm a timer; returns false if it already fired or was cancelled
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let key = self.queue.keys().find(|(_, t)| *t == id).copied();
        match key {
            Some(k) => self.queue.remove(&k).is_some(),
            None => false,
        }
    }

    /// Remove and return all timers due at `now`, earliest first
    pub fn pop_due(&mut self, now: u64) -> Vec<(TimerId, TimerEvent)> {
        let mut due = Vec::new();
        loop {
            let (deadline, id) = match self.queue.keys().next() {
                Some(k) => *k,
                None => break,
            };
            if deadline > now {
                break;
            }
            if let Some(ev) = self.queue.remove(&(deadline, id)) {
                due.push((id, ev));
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.keys().next().map(|(d, _)| *d)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.queue.keys().any(|(_, t)| *t == id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
