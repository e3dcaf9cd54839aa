//! Clock Scheduler - shared virtual timeline for offline clocks
//!
//! Every offline clock keeps its own queue in beats. The scheduler tracks
//! the time in seconds at which each clock's head entry is due and steps
//! virtual time from one due clock to the next, one slice at a time.

use crate::clock::ClockId;
use crate::engine::ClockShared;
use crate::pq::{sequence_watermark, TaskQueue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace, warn};

/// Scheduler execution mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerMode {
    Realtime,
    Offline,
}

impl FromStr for SchedulerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "realtime" | "rt" => Ok(SchedulerMode::Realtime),
            "offline" | "nrt" => Ok(SchedulerMode::Offline),
            other => Err(other.to_string()),
        }
    }
}

struct SchedulerInner {
    /// Virtual now.
    seconds: f64,
    /// clock id -> time its head entry is due.
    heads: TaskQueue<ClockId>,
    clocks: HashMap<ClockId, Weak<ClockShared>>,
}

/// The offline timeline.
///
/// Lock order: a clock never calls in here while holding its own state
/// lock, and the scheduler never calls a clock while holding its lock.
pub struct ClockScheduler {
    inner: Mutex<SchedulerInner>,
    recursive: AtomicBool,
}

impl ClockScheduler {
    pub fn new(recursive: bool) -> Self {
        Self {
            inner: Mutex::new(SchedulerInner {
                seconds: 0.0,
                heads: TaskQueue::new(),
                clocks: HashMap::new(),
            }),
            recursive: AtomicBool::new(recursive),
        }
    }

    /// Current virtual time.
    pub fn seconds(&self) -> f64 {
        self.inner.lock().seconds
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive.load(Ordering::SeqCst)
    }

    /// With `recursive`, entries scheduled during an advance run in that same
    /// advance when they fall inside it. Without, they wait for the next one.
    pub fn set_recursive(&self, recursive: bool) {
        self.recursive.store(recursive, Ordering::SeqCst);
    }

    /// Time of the earliest registered clock head.
    pub fn next_event_time(&self) -> Option<f64> {
        self.inner.lock().heads.peek_priority()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().heads.is_empty()
    }

    /// Record that `clock`'s head entry is due at `seconds`.
    pub(crate) fn register(&self, clock: &Arc<ClockShared>, seconds: f64) {
        let mut inner = self.inner.lock();
        if inner.heads.priority_of(&clock.id) == Some(seconds) {
            return;
        }
        inner.heads.add(seconds, clock.id);
        inner.clocks.insert(clock.id, Arc::downgrade(clock));
    }

    pub(crate) fn unregister(&self, clock_id: ClockId) {
        let mut inner = self.inner.lock();
        inner.heads.remove(&clock_id);
        inner.clocks.remove(&clock_id);
    }

    /// Forget every clock and rewind to zero.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.seconds = 0.0;
        inner.heads.clear();
        inner.clocks.clear();
    }

    /// Run every slice due at or before `target`, then leave virtual time
    /// at `target`. Returns the number of slices processed.
    pub(crate) fn advance_to(&self, target: f64, max_slices: usize) -> usize {
        let now = self.seconds();
        if target.is_nan() || target < now {
            warn!(target, now, "offline time cannot move backwards");
            return 0;
        }

        let recursive = self.is_recursive();
        let watermark = if recursive {
            u64::MAX
        } else {
            sequence_watermark()
        };

        let mut touched: Vec<Arc<ClockShared>> = Vec::new();
        let mut processed = 0usize;

        loop {
            let next = {
                let mut inner = self.inner.lock();
                match inner.heads.peek_entry() {
                    Some((due, _, id)) if due <= target => {
                        inner.heads.remove(&id);
                        if due > inner.seconds {
                            inner.seconds = due;
                        }
                        let clock = inner.clocks.get(&id).and_then(Weak::upgrade);
                        if clock.is_none() {
                            inner.clocks.remove(&id);
                        }
                        clock
                    }
                    _ => break,
                }
            };
            let Some(clock) = next else {
                continue;
            };

            trace!(clock = %clock.name, seconds = self.seconds(), "offline slice");
            clock.run_offline_slice(target, watermark);
            clock.refresh_offline_head(watermark);
            if !recursive && !touched.iter().any(|c| c.id == clock.id) {
                touched.push(clock);
            }

            processed += 1;
            if processed >= max_slices {
                error!(
                    processed,
                    target, "offline advance hit its slice limit; stopping early"
                );
                break;
            }
        }

        {
            let mut inner = self.inner.lock();
            if inner.seconds < target {
                inner.seconds = target;
            }
        }

        // Entries held back by the watermark become visible again.
        for clock in touched {
            clock.refresh_offline_head(u64::MAX);
        }
        processed
    }

    /// Advance until no clock has anything left to run.
    pub(crate) fn run_until_idle(&self, max_slices: usize) -> usize {
        let mut processed = 0usize;
        while let Some(next) = self.next_event_time() {
            if processed >= max_slices {
                error!(processed, "run_until_idle hit its slice limit");
                break;
            }
            let target = next.max(self.seconds());
            processed += self.advance_to(target, max_slices - processed);
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_creation() {
        let sched = ClockScheduler::new(false);
        assert!((sched.seconds() - 0.0).abs() < 1e-10);
        assert!(!sched.is_recursive());
        assert!(!sched.has_pending());
    }

    #[test]
    fn test_peek_next_event_time_empty() {
        let sched = ClockScheduler::new(true);
        assert_eq!(sched.next_event_time(), None);
    }

    #[test]
    fn test_advance_moves_time_forward_only() {
        let sched = ClockScheduler::new(false);
        assert_eq!(sched.advance_to(2.5, 10), 0);
        assert_eq!(sched.seconds(), 2.5);
        assert_eq!(sched.advance_to(1.0, 10), 0);
        assert_eq!(sched.seconds(), 2.5);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Offline".parse::<SchedulerMode>(), Ok(SchedulerMode::Offline));
        assert_eq!("realtime".parse::<SchedulerMode>(), Ok(SchedulerMode::Realtime));
        assert!("sometimes".parse::<SchedulerMode>().is_err());
    }
}
