use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::to_chrono;

/// Where a [`Debouncer`] is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    /// A write is scheduled for `deadline`; new activity pushes it back.
    Pending { deadline: DateTime<Utc> },
    /// A write is in progress. `rearm` records activity that arrived
    /// meanwhile, which schedules another write once this one finishes.
    Flushing { rearm: bool },
}

/// Coalesces bursts of activity into one write after a quiet period.
///
/// Pure state machine: callers feed it the current time and perform the
/// write themselves between [`Debouncer::begin_flush`] and
/// [`Debouncer::finish_flush`].
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: chrono::Duration,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay: to_chrono(delay),
            state: DebounceState::Idle,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self.state {
            DebounceState::Pending { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Records activity at `now`.
    pub fn schedule(&mut self, now: DateTime<Utc>) {
        self.state = match self.state {
            DebounceState::Idle | DebounceState::Pending { .. } => DebounceState::Pending {
                deadline: now + self.delay,
            },
            DebounceState::Flushing { .. } => DebounceState::Flushing { rearm: true },
        };
    }

    /// Drops a scheduled write, including one queued behind a running flush.
    pub fn cancel(&mut self) {
        self.state = match self.state {
            DebounceState::Flushing { .. } => DebounceState::Flushing { rearm: false },
            DebounceState::Idle | DebounceState::Pending { .. } => DebounceState::Idle,
        };
    }

    /// Whether a scheduled write should fire at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, DebounceState::Pending { deadline } if now >= deadline)
    }

    /// Enters `Flushing`. Returns `false` if a flush is already running.
    pub fn begin_flush(&mut self) -> bool {
        if matches!(self.state, DebounceState::Flushing { .. }) {
            return false;
        }
        self.state = DebounceState::Flushing { rearm: false };
        true
    }

    /// Leaves `Flushing`, re-arming if activity arrived during the write.
    pub fn finish_flush(&mut self, now: DateTime<Utc>) {
        if let DebounceState::Flushing { rearm } = self.state {
            self.state = if rearm {
                DebounceState::Pending {
                    deadline: now + self.delay,
                }
            } else {
                DebounceState::Idle
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn bursts_push_the_deadline_back() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        debouncer.schedule(at(0));
        debouncer.schedule(at(300));

        assert!(!debouncer.due(at(600)));
        assert!(debouncer.due(at(800)));
        assert_eq!(debouncer.deadline(), Some(at(800)));
    }

    #[test]
    fn full_cycle_returns_to_idle() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        debouncer.schedule(at(0));
        assert!(debouncer.begin_flush());
        assert_eq!(debouncer.state(), DebounceState::Flushing { rearm: false });
        assert!(!debouncer.begin_flush());

        debouncer.finish_flush(at(50));
        assert_eq!(debouncer.state(), DebounceState::Idle);
        assert!(!debouncer.due(at(10_000)));
    }

    #[test]
    fn activity_during_flush_rearms() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        debouncer.schedule(at(0));
        debouncer.begin_flush();
        debouncer.schedule(at(20));
        debouncer.finish_flush(at(30));

        assert_eq!(debouncer.deadline(), Some(at(130)));
    }

    #[test]
    fn cancel_clears_pending_and_rearm() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        debouncer.schedule(at(0));
        debouncer.cancel();
        assert_eq!(debouncer.state(), DebounceState::Idle);

        debouncer.schedule(at(0));
        debouncer.begin_flush();
        debouncer.schedule(at(1));
        debouncer.cancel();
        debouncer.finish_flush(at(2));
        assert_eq!(debouncer.state(), DebounceState::Idle);
    }
}
