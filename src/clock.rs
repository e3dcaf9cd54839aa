//! Clocks - public handles over a scheduling engine
//!
//! `Clock` is the common surface of every clock: a queue keyed in beats and
//! a beats/seconds map. System and app clocks use the identity map;
//! `TempoClock` adds tempo and meter control.

use crate::context;
use crate::engine::ClockShared;
use crate::error::{ClockError, Result};
use crate::scheduler::SchedulerMode;
use crate::task::{TaskHandle, TaskId};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

pub type ClockId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockKind {
    /// Physical time, drift-free rescheduling.
    System,
    /// Physical time, reschedules relative to when the task actually ran.
    App,
    Tempo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnginePhase {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Where `play` starts a task: the next multiple of `quant` beats, shifted
/// by `phase` and pulled earlier by `timing_offset`.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Quant {
    pub quant: f64,
    pub phase: f64,
    pub timing_offset: f64,
}

impl Quant {
    pub fn new(quant: f64) -> Self {
        Self {
            quant,
            ..Self::default()
        }
    }

    pub fn with_phase(mut self, phase: f64) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_offset(mut self, timing_offset: f64) -> Self {
        self.timing_offset = timing_offset;
        self
    }

    pub fn next_time_on_grid(&self, clock: &Clock) -> f64 {
        clock.next_time_on_grid(self.quant, self.phase - self.timing_offset)
    }
}

impl From<f64> for Quant {
    fn from(quant: f64) -> Self {
        Quant::new(quant)
    }
}

impl From<(f64, f64)> for Quant {
    fn from((quant, phase): (f64, f64)) -> Self {
        Quant::new(quant).with_phase(phase)
    }
}

/// Handle to a running clock. Clones refer to the same clock.
#[derive(Clone)]
pub struct Clock {
    pub(crate) shared: Arc<ClockShared>,
}

impl Clock {
    pub(crate) fn from_shared(shared: Arc<ClockShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> ClockId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> ClockKind {
        self.shared.kind
    }

    pub fn mode(&self) -> SchedulerMode {
        self.shared.mode
    }

    pub fn phase(&self) -> EnginePhase {
        self.shared.phase()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Run `task` `delta` beats after this thread's current beat.
    pub fn sched(&self, delta: f64, task: impl Into<TaskHandle>) -> Result<()> {
        if delta.is_nan() {
            return Err(ClockError::InvalidTime(delta));
        }
        if delta == f64::INFINITY {
            return Ok(());
        }
        let beats = self.beats();
        self.sched_abs(beats + delta, task)
    }

    /// Run `task` at absolute `beats`.
    pub fn sched_abs(&self, beats: f64, task: impl Into<TaskHandle>) -> Result<()> {
        self.shared.schedule_abs(beats, task.into())
    }

    /// Run `task` at the next grid point of `quant`.
    pub fn play(&self, task: impl Into<TaskHandle>, quant: impl Into<Quant>) -> Result<()> {
        let beats = quant.into().next_time_on_grid(self);
        self.sched_abs(beats, task)
    }

    /// Take `task` out of the queue. False if it was not queued here.
    pub fn remove(&self, task: impl Into<TaskHandle>) -> bool {
        self.shared.remove_task(&task.into())
    }

    pub fn clear(&self) {
        self.shared.clear();
    }

    /// Stop the clock. Queued tasks are dropped without being resumed.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Logical seconds of the calling thread.
    pub fn seconds(&self) -> f64 {
        context::logical_seconds().unwrap_or_else(|| self.elapsed_seconds())
    }

    pub fn beats(&self) -> f64 {
        self.secs2beats(self.seconds())
    }

    /// Physical time on this clock's timeline.
    pub fn elapsed_seconds(&self) -> f64 {
        self.shared.core.elapsed()
    }

    pub fn elapsed_beats(&self) -> f64 {
        self.secs2beats(self.elapsed_seconds())
    }

    pub fn secs2beats(&self, seconds: f64) -> f64 {
        self.shared.state.lock().map.secs2beats(seconds)
    }

    pub fn beats2secs(&self, beats: f64) -> f64 {
        self.shared.state.lock().map.beats2secs(beats)
    }

    pub fn next_time_on_grid(&self, quant: f64, phase: f64) -> f64 {
        let beats = self.beats();
        self.shared
            .state
            .lock()
            .map
            .next_time_on_grid(beats, quant, phase)
    }

    /// Queued entries in firing order, as (beats, task id).
    pub fn queue_snapshot(&self) -> Vec<(f64, TaskId)> {
        self.shared
            .state
            .lock()
            .queue
            .iter()
            .map(|(beats, task)| (beats, task.id()))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.state.lock().queue.is_empty()
    }

    /// NTP timestamp for `seconds` on this clock's timeline.
    pub fn seconds_to_wire(&self, seconds: f64) -> u64 {
        self.shared.core.to_wire(seconds)
    }

    pub fn beats_to_wire(&self, beats: f64) -> u64 {
        self.seconds_to_wire(self.beats2secs(beats))
    }
}

impl PartialEq for Clock {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Clock {}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .finish()
    }
}

/// Settings for a new tempo clock.
#[derive(Clone, Debug)]
pub struct TempoClockOptions {
    pub name: Option<String>,
    /// Beats per second.
    pub tempo: f64,
    /// Beat position at `seconds`.
    pub beats: f64,
    /// Anchor time; the creating thread's logical time when `None`.
    pub seconds: Option<f64>,
    pub beats_per_bar: f64,
    pub permanent: bool,
}

impl TempoClockOptions {
    pub fn new(tempo: f64) -> Self {
        Self {
            name: None,
            tempo,
            beats: 0.0,
            seconds: None,
            beats_per_bar: 4.0,
            permanent: false,
        }
    }
}

/// A clock with a variable tempo and a bar grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TempoClock {
    clock: Clock,
}

impl Deref for TempoClock {
    type Target = Clock;

    fn deref(&self) -> &Clock {
        &self.clock
    }
}

impl TempoClock {
    pub(crate) fn from_clock(clock: Clock) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Beats per second.
    pub fn tempo(&self) -> f64 {
        self.shared.state.lock().map.tempo()
    }

    pub fn bpm(&self) -> f64 {
        self.tempo() * 60.0
    }

    /// Change tempo at the current beat. Rejects non-positive tempi, and any
    /// change while the tempo is negative (only `set_etempo` can leave a
    /// negative tempo).
    pub fn set_tempo(&self, tempo: f64) -> Result<()> {
        if !tempo.is_finite() || tempo <= 0.0 {
            warn!(clock = %self.name(), tempo, "rejected tempo");
            return Err(ClockError::InvalidTempo(tempo));
        }
        let seconds = self.seconds();
        {
            let mut st = self.shared.state.lock();
            if matches!(st.phase, EnginePhase::Stopping | EnginePhase::Stopped) {
                return Err(ClockError::EngineNotRunning(self.shared.name.clone()));
            }
            let current = st.map.tempo();
            if current < 0.0 {
                warn!(clock = %self.name(), current, "tempo is negative; only set_etempo may change it");
                return Err(ClockError::InvalidTempo(current));
            }
            let beats = st.map.secs2beats(seconds);
            if current == 0.0 {
                // Stalled: the current beat is pinned, anchor at now.
                st.map.set_tempo_at_sec(tempo, seconds);
            } else {
                st.map.set_tempo_at_beat(tempo, beats);
            }
        }
        self.shared.queue_changed();
        debug!(clock = %self.name(), tempo, "tempo changed");
        Ok(())
    }

    /// Change tempo at the current seconds. Accepts any finite tempo,
    /// including zero and negative ones.
    pub fn set_etempo(&self, tempo: f64) -> Result<()> {
        if !tempo.is_finite() {
            return Err(ClockError::InvalidTempo(tempo));
        }
        let seconds = self.seconds();
        {
            let mut st = self.shared.state.lock();
            if matches!(st.phase, EnginePhase::Stopping | EnginePhase::Stopped) {
                return Err(ClockError::EngineNotRunning(self.shared.name.clone()));
            }
            st.map.set_tempo_at_sec(tempo, seconds);
        }
        self.shared.queue_changed();
        debug!(clock = %self.name(), tempo, seconds, "tempo changed at seconds");
        Ok(())
    }

    pub fn beats_per_bar(&self) -> f64 {
        self.shared.state.lock().map.beats_per_bar()
    }

    /// Change the meter at the current beat. Only allowed from a task
    /// running on this clock.
    pub fn set_beats_per_bar(&self, beats_per_bar: f64) -> Result<()> {
        let on_this_clock = context::current_clock().is_some_and(|c| c.id() == self.id());
        if !on_this_clock {
            return Err(ClockError::WrongSchedulingThread(self.shared.name.clone()));
        }
        let beats = self.beats();
        self.shared
            .state
            .lock()
            .map
            .set_meter_at_beat(beats_per_bar, beats)?;
        debug!(clock = %self.name(), beats_per_bar, beats, "meter changed");
        Ok(())
    }

    pub fn base_bar_beat(&self) -> f64 {
        self.shared.state.lock().map.base_bar_beat()
    }

    pub fn base_bar(&self) -> f64 {
        self.shared.state.lock().map.base_bar()
    }

    pub fn beats2bars(&self, beats: f64) -> f64 {
        self.shared.state.lock().map.beats2bars(beats)
    }

    pub fn bars2beats(&self, bars: f64) -> f64 {
        self.shared.state.lock().map.bars2beats(bars)
    }

    /// Bar containing the current beat.
    pub fn bar(&self) -> f64 {
        let beats = self.beats();
        self.shared.state.lock().map.bar(beats)
    }

    /// First bar line at or after the current beat.
    pub fn next_bar(&self) -> f64 {
        let beats = self.beats();
        self.next_bar_after(beats)
    }

    pub fn next_bar_after(&self, beats: f64) -> f64 {
        self.shared.state.lock().map.next_bar(beats)
    }

    pub fn beat_in_bar(&self) -> f64 {
        let beats = self.beats();
        self.shared.state.lock().map.beat_in_bar(beats)
    }

    /// Permanent clocks survive `stop_all_tempo_clocks` and aborts.
    pub fn set_permanent(&self, permanent: bool) {
        self.shared.permanent.store(permanent, Ordering::SeqCst);
    }

    pub fn is_permanent(&self) -> bool {
        self.shared.is_permanent()
    }
}
