//! Trailing-edge debounce timers for concern re-evaluation.
//!
//! The scheduler is a plain timer table driven by whoever owns the event
//! loop: it never sleeps itself. Callers ask for [`DebounceScheduler::next_deadline`],
//! wait until then, and pop whatever is due.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug, Default)]
pub struct DebounceScheduler {
    timers: BTreeMap<TimerHandle, Instant>,
    next_id: u64,
}

impl DebounceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a timer for the owner of `slot`, cancelling the one it already holds.
    pub fn schedule(&mut self, slot: &mut Option<TimerHandle>, now: Instant, delay: Duration) -> TimerHandle {
        if let Some(previous) = slot.take() {
            self.cancel(previous);
        }
        self.next_id += 1;
        let handle = TimerHandle(self.next_id);
        self.timers.insert(handle, now + delay);
        trace!(timer = handle.0, delay_ms = delay.as_millis() as u64, "debounce scheduled");
        *slot = Some(handle);
        handle
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(&handle).is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().min().copied()
    }

    /// Remove and return the earliest timer due at `now`. Ties go to the
    /// timer that was scheduled first.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerHandle> {
        let (&handle, _) = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .min_by_key(|(h, deadline)| (**deadline, **h))?;
        self.timers.remove(&handle);
        Some(handle)
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}
