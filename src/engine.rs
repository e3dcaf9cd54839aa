//! Engine - realtime and offline execution loops for one clock
//!
//! A clock's queue is keyed in beats. Both drivers share the same batch
//! rules:
//! - a batch runs entries due at batch start that were inserted before it
//!   started (sequence watermark), so a task that reschedules itself at the
//!   same instant runs in the next batch
//! - each entry runs with the clock's lock released and the thread's logical
//!   time set to the entry's time
//! - a numeric result reschedules the task at `entry + delta`
//!
//! - Realtime: a worker thread per clock waits on a condvar and spins the
//!   last stretch with spin_sleep
//! - Offline: the clock registers its head with the shared `ClockScheduler`

use crate::authority::AuthorityCore;
use crate::clock::{Clock, ClockId, ClockKind, EnginePhase};
use crate::context;
use crate::error::{ClockError, Result};
use crate::pq::{sequence_watermark, TaskQueue};
use crate::scheduler::SchedulerMode;
use crate::task::TaskHandle;
use crate::tempo::TempoMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use spin_sleep::SpinSleeper;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, debug_span, error, trace, warn};

static CLOCK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ClockState {
    pub queue: TaskQueue<TaskHandle>,
    pub map: TempoMap,
    pub phase: EnginePhase,
}

impl ClockState {
    /// Earliest entry the current pass may run.
    fn eligible_head(&mut self, watermark: u64) -> Option<(f64, u64, TaskHandle)> {
        if watermark == u64::MAX {
            self.queue.peek_entry()
        } else {
            self.queue.peek_before(watermark)
        }
    }

    /// Logical seconds at which the entry at `beats` falls due, seen from
    /// `now`. A clock that is not moving forward only reaches entries at or
    /// behind its current beat; those are due at once, never in the past
    /// of an earlier beat. `None` means never at the current tempo.
    fn due_seconds(&self, beats: f64, now: f64) -> Option<f64> {
        if self.map.tempo() > 0.0 {
            return Some(self.map.beats2secs(beats));
        }
        (beats <= self.map.secs2beats(now)).then(|| self.map.beats2secs(beats).min(now))
    }
}

pub(crate) struct ClockShared {
    pub id: ClockId,
    pub kind: ClockKind,
    pub name: String,
    pub mode: SchedulerMode,
    pub core: Arc<AuthorityCore>,
    pub state: Mutex<ClockState>,
    pub permanent: AtomicBool,
    wake: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClockShared {
    pub(crate) fn new(
        kind: ClockKind,
        name: String,
        map: TempoMap,
        core: Arc<AuthorityCore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: CLOCK_ID_COUNTER.fetch_add(1, Ordering::SeqCst),
            kind,
            name,
            mode: core.mode(),
            core,
            state: Mutex::new(ClockState {
                queue: TaskQueue::new(),
                map,
                phase: EnginePhase::NotStarted,
            }),
            permanent: AtomicBool::new(false),
            wake: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.phase != EnginePhase::NotStarted {
                return Ok(());
            }
            st.phase = EnginePhase::Running;
        }

        if self.mode == SchedulerMode::Realtime {
            let shared = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("clock-{}", self.name))
                .spawn(move || shared.run_realtime());
            match spawned {
                Ok(handle) => *self.worker.lock() = Some(handle),
                Err(e) => {
                    self.state.lock().phase = EnginePhase::Stopped;
                    return Err(e.into());
                }
            }
        }

        debug!(clock = %self.name, id = self.id, mode = ?self.mode, "clock started");
        Ok(())
    }

    pub(crate) fn phase(&self) -> EnginePhase {
        self.state.lock().phase
    }

    pub(crate) fn is_running(&self) -> bool {
        self.phase() == EnginePhase::Running
    }

    pub(crate) fn is_permanent(&self) -> bool {
        self.permanent.load(Ordering::SeqCst)
    }

    fn not_running(&self) -> ClockError {
        ClockError::EngineNotRunning(self.name.clone())
    }

    /// Queue `task` at absolute `beats`, taking it off any other clock.
    pub(crate) fn schedule_abs(self: &Arc<Self>, beats: f64, task: TaskHandle) -> Result<()> {
        if beats.is_nan() || beats == f64::NEG_INFINITY {
            return Err(ClockError::InvalidTime(beats));
        }
        if !self.is_running() {
            return Err(self.not_running());
        }
        if beats == f64::INFINITY {
            trace!(clock = %self.name, task = %task.label(), "infinite time; not scheduled");
            return Ok(());
        }

        if let Some(prev) = task.slot().claim(self) {
            prev.remove_task(&task);
        }
        {
            let mut st = self.state.lock();
            if st.phase != EnginePhase::Running {
                task.slot().release(self.id);
                return Err(self.not_running());
            }
            st.queue.add(beats, task);
        }
        self.queue_changed();
        Ok(())
    }

    pub(crate) fn remove_task(self: &Arc<Self>, task: &TaskHandle) -> bool {
        let removed = self.state.lock().queue.remove(task);
        if removed {
            task.slot().release(self.id);
            self.queue_changed();
        }
        removed
    }

    pub(crate) fn clear(self: &Arc<Self>) {
        let drained = {
            let mut st = self.state.lock();
            let drained = st.queue.snapshot();
            st.queue.clear();
            drained
        };
        for (_, task) in &drained {
            task.slot().release(self.id);
        }
        debug!(clock = %self.name, removed = drained.len(), "queue cleared");
        self.queue_changed();
    }

    /// Stop the driver. Queued tasks are released without being resumed.
    /// Joins the worker unless called from it.
    pub(crate) fn stop(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            match st.phase {
                EnginePhase::Stopping | EnginePhase::Stopped => return,
                EnginePhase::NotStarted | EnginePhase::Running => {
                    st.phase = EnginePhase::Stopping
                }
            }
        }
        self.wake.notify_all();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!(clock = %self.name, "clock worker panicked");
            }
        }

        let drained = {
            let mut st = self.state.lock();
            st.phase = EnginePhase::Stopped;
            let drained = st.queue.snapshot();
            st.queue.clear();
            drained
        };
        for (_, task) in drained {
            task.slot().release(self.id);
        }
        if self.mode == SchedulerMode::Offline {
            self.core.offline.unregister(self.id);
        }
        debug!(clock = %self.name, id = self.id, "clock stopped");
    }

    /// Tempo or queue head changed.
    pub(crate) fn queue_changed(self: &Arc<Self>) {
        match self.mode {
            SchedulerMode::Realtime => {
                self.wake.notify_one();
            }
            SchedulerMode::Offline => self.refresh_offline_head(u64::MAX),
        }
    }

    fn run_realtime(self: Arc<Self>) {
        let span = debug_span!("clock", name = %self.name, id = self.id);
        let _enter = span.enter();
        context::reseed_thread(&format!("{}/{}", self.core.config.seed, self.name));

        let sleeper = SpinSleeper::default();
        let spin = self.core.config.spin_threshold;
        let clock = Clock::from_shared(Arc::clone(&self));

        let mut st = self.state.lock();
        loop {
            if st.phase != EnginePhase::Running {
                break;
            }
            let Some(head) = st.queue.peek_priority() else {
                self.wake.wait(&mut st);
                continue;
            };
            let now = self.core.elapsed();
            let Some(due) = st.due_seconds(head, now) else {
                // Stalled or reversed tempo: wait for a retime.
                self.wake.wait(&mut st);
                continue;
            };
            if due > now {
                let remaining = Duration::try_from_secs_f64(due - now).unwrap_or(Duration::MAX);
                if remaining > spin {
                    self.wake.wait_for(&mut st, remaining - spin);
                } else {
                    MutexGuard::unlocked(&mut st, || sleeper.sleep(remaining));
                }
                continue;
            }
            self.drain(&clock, &mut st, now);
        }
        debug!("clock worker exiting");
    }

    /// One realtime batch.
    fn drain(self: &Arc<Self>, clock: &Clock, st: &mut MutexGuard<'_, ClockState>, now: f64) {
        let watermark = sequence_watermark();
        while st.phase == EnginePhase::Running {
            let Some((beats, seq, _)) = st.queue.peek_entry() else {
                break;
            };
            if seq >= watermark {
                break;
            }
            let Some(seconds) = st.due_seconds(beats, now).filter(|s| *s <= now) else {
                break;
            };
            let Ok((beats, task)) = st.queue.pop() else {
                break;
            };
            task.slot().release(self.id);

            let delay = MutexGuard::unlocked(st, || self.run_task(clock, beats, seconds, &task));
            if let Some(delta) = delay {
                self.requeue(st, beats, delta, task);
            }
        }
    }

    /// Run every entry at this clock's head beat that is due by `until`.
    pub(crate) fn run_offline_slice(self: &Arc<Self>, until: f64, watermark: u64) {
        let clock = Clock::from_shared(Arc::clone(self));
        let now = self.core.elapsed();
        let mut st = self.state.lock();
        if st.phase != EnginePhase::Running {
            return;
        }
        let Some((beats, _, _)) = st.eligible_head(watermark) else {
            return;
        };
        let Some(seconds) = st.due_seconds(beats, now).filter(|s| *s <= until) else {
            return;
        };

        while st.phase == EnginePhase::Running {
            let task = match st.eligible_head(watermark) {
                Some((b, _, task)) if b.to_bits() == beats.to_bits() => task,
                _ => break,
            };
            st.queue.remove(&task);
            task.slot().release(self.id);

            let delay = MutexGuard::unlocked(&mut st, || self.run_task(&clock, beats, seconds, &task));
            if let Some(delta) = delay {
                self.requeue(&mut st, beats, delta, task);
            }
        }
    }

    /// Tell the offline scheduler when the next eligible entry is due.
    pub(crate) fn refresh_offline_head(self: &Arc<Self>, watermark: u64) {
        if self.mode != SchedulerMode::Offline {
            return;
        }
        let now = self.core.elapsed();
        let due = {
            let mut st = self.state.lock();
            if st.phase != EnginePhase::Running {
                None
            } else {
                st.eligible_head(watermark)
                    .and_then(|(beats, _, _)| st.due_seconds(beats, now))
            }
        };
        match due {
            Some(seconds) => self.core.offline.register(self, seconds),
            None => self.core.offline.unregister(self.id),
        }
    }

    fn requeue(
        self: &Arc<Self>,
        st: &mut MutexGuard<'_, ClockState>,
        beats: f64,
        delta: f64,
        task: TaskHandle,
    ) {
        if st.phase != EnginePhase::Running || delta == f64::INFINITY {
            return;
        }
        if delta.is_nan() {
            warn!(clock = %self.name, task = %task.label(), "task returned NaN delay; dropping it");
            return;
        }
        // The task moved itself to another clock while it ran.
        if matches!(task.slot().clock_id(), Some(home) if home != self.id) {
            return;
        }
        let next = match self.kind {
            ClockKind::App => st.map.secs2beats(self.core.elapsed()) + delta,
            ClockKind::System | ClockKind::Tempo => beats + delta,
        };
        task.slot().claim(self);
        st.queue.add(next, task);
    }

    /// Wake one task with the thread context pointing at this clock.
    /// Returns the reschedule delay, if any. Failures are logged and the
    /// task is dropped.
    fn run_task(&self, clock: &Clock, beats: f64, seconds: f64, task: &TaskHandle) -> Option<f64> {
        let _frame = context::enter_clock(seconds, Some(clock.clone()));
        match panic::catch_unwind(AssertUnwindSafe(|| task.awake(beats, seconds, clock))) {
            Ok(Ok(value)) => value.as_delay(),
            Ok(Err(err)) => {
                error!(
                    task = %task.label(),
                    clock = %self.name,
                    beats,
                    error = %format!("{err:#}"),
                    "task failed; dropping it"
                );
                None
            }
            Err(payload) => {
                error!(
                    task = %task.label(),
                    clock = %self.name,
                    beats,
                    panic = %panic_message(payload.as_ref()),
                    "task panicked; dropping it"
                );
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(map: TempoMap) -> ClockState {
        ClockState {
            queue: TaskQueue::new(),
            map,
            phase: EnginePhase::Running,
        }
    }

    #[test]
    fn test_due_seconds_forward_tempo() {
        let st = state_with(TempoMap::new(2.0, 0.0, 0.0, 4.0));
        assert_eq!(st.due_seconds(4.0, 0.0), Some(2.0));
        assert_eq!(st.due_seconds(1.0, 5.0), Some(0.5));
    }

    #[test]
    fn test_due_seconds_reversed_tempo() {
        // Beat 4 at 4s, then running backwards: beat 3 at 5s.
        let mut map = TempoMap::new(1.0, 0.0, 0.0, 4.0);
        map.set_tempo_at_sec(-1.0, 4.0);
        let st = state_with(map);

        assert_eq!(st.due_seconds(10.0, 5.0), None);
        assert_eq!(st.due_seconds(3.5, 5.0), None);
        // Already passed in beats: due now, not at a later second.
        assert_eq!(st.due_seconds(2.0, 5.0), Some(5.0));
    }

    #[test]
    fn test_due_seconds_stalled_tempo() {
        let mut map = TempoMap::new(1.0, 0.0, 0.0, 4.0);
        map.set_tempo_at_sec(0.0, 2.0);
        let st = state_with(map);

        assert_eq!(st.due_seconds(3.0, 9.0), None);
        assert_eq!(st.due_seconds(2.0, 9.0), Some(2.0));
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let n = 3;
        let payload = panic::catch_unwind(|| panic!("formatted {}", n)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 3");
    }
}
