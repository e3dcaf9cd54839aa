//! Time Authority - the timeline every clock of a process shares
//!
//! Owns the scheduling mode, the origin of elapsed time, the offline
//! scheduler and the system/app clock singletons. Clocks only hold the
//! `AuthorityCore`; the registry holds clocks weakly.

use crate::clock::{Clock, ClockKind, TempoClock, TempoClockOptions};
use crate::config::{load_dotenv, EngineConfig};
use crate::context;
use crate::engine::ClockShared;
use crate::error::{ClockError, Result};
use crate::scheduler::{ClockScheduler, SchedulerMode};
use crate::tempo::TempoMap;
use parking_lot::{Mutex, RwLock};
use rosc::OscTime;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Seconds from 1900-01-01 (NTP epoch) to 1970-01-01 (Unix epoch).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
const TWO_POW_32: f64 = 4_294_967_296.0;

/// NTP 32.32 fixed point for a wall-clock time.
fn system_time_to_wire(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since_unix) => {
            let seconds = (since_unix.as_secs() + NTP_UNIX_OFFSET) & 0xFFFF_FFFF;
            let fractional = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
            (seconds << 32) | fractional
        }
        Err(_) => {
            warn!("system clock is before the Unix epoch; wire times start at zero");
            0
        }
    }
}

struct Timeline {
    mode: SchedulerMode,
    origin: Instant,
    /// Wire timestamp of elapsed time zero.
    wire_epoch: u64,
}

impl Timeline {
    fn new(mode: SchedulerMode) -> Self {
        let wire_epoch = match mode {
            SchedulerMode::Realtime => system_time_to_wire(SystemTime::now()),
            SchedulerMode::Offline => 0,
        };
        Self {
            mode,
            origin: Instant::now(),
            wire_epoch,
        }
    }
}

/// The part of the authority clocks hold on to.
pub(crate) struct AuthorityCore {
    pub config: EngineConfig,
    pub offline: ClockScheduler,
    timeline: RwLock<Timeline>,
}

impl AuthorityCore {
    fn new(config: EngineConfig) -> Self {
        Self {
            offline: ClockScheduler::new(config.recursive_offline),
            timeline: RwLock::new(Timeline::new(config.mode)),
            config,
        }
    }

    pub(crate) fn mode(&self) -> SchedulerMode {
        self.timeline.read().mode
    }

    /// Seconds since the origin: monotonic in realtime, virtual offline.
    pub(crate) fn elapsed(&self) -> f64 {
        let timeline = self.timeline.read();
        match timeline.mode {
            SchedulerMode::Realtime => timeline.origin.elapsed().as_secs_f64(),
            SchedulerMode::Offline => self.offline.seconds(),
        }
    }

    pub(crate) fn to_wire(&self, seconds: f64) -> u64 {
        let epoch = self.timeline.read().wire_epoch as i128;
        let offset = (seconds * TWO_POW_32).round();
        if offset.is_nan() {
            return epoch as u64;
        }
        // Float to int casts saturate.
        epoch
            .saturating_add(offset as i128)
            .clamp(0, u64::MAX as i128) as u64
    }

    pub(crate) fn from_wire(&self, wire: u64) -> f64 {
        let epoch = self.timeline.read().wire_epoch as i128;
        (wire as i128 - epoch) as f64 / TWO_POW_32
    }

    fn reset(&self, mode: SchedulerMode) {
        *self.timeline.write() = Timeline::new(mode);
        self.offline.reset();
    }
}

type AbortHook = Box<dyn Fn() + Send + Sync>;

/// Process-wide time source and clock registry.
///
/// Most programs use [`TimeAuthority::global`]. Separate instances are
/// independent timelines, which keeps tests from sharing state.
pub struct TimeAuthority {
    core: Arc<AuthorityCore>,
    system: Mutex<Option<Clock>>,
    app: Mutex<Option<Clock>>,
    clocks: Mutex<Vec<Weak<ClockShared>>>,
    abort_hooks: Mutex<Vec<AbortHook>>,
}

static GLOBAL: OnceLock<TimeAuthority> = OnceLock::new();

impl TimeAuthority {
    pub fn new(config: EngineConfig) -> Self {
        debug!(mode = ?config.mode, seed = %config.seed, "time authority created");
        Self {
            core: Arc::new(AuthorityCore::new(config)),
            system: Mutex::new(None),
            app: Mutex::new(None),
            clocks: Mutex::new(Vec::new()),
            abort_hooks: Mutex::new(Vec::new()),
        }
    }

    /// The process authority, configured from the environment on first use.
    pub fn global() -> &'static TimeAuthority {
        GLOBAL.get_or_init(|| {
            load_dotenv();
            TimeAuthority::new(EngineConfig::from_env())
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn mode(&self) -> SchedulerMode {
        self.core.mode()
    }

    /// Stop every clock, then restart the timeline in `mode`. System and app
    /// clocks are recreated on next access.
    pub fn switch_mode(&self, mode: SchedulerMode) {
        self.shutdown();
        self.core.reset(mode);
        info!(mode = ?mode, "time authority switched mode");
    }

    /// Seconds since the origin of the timeline.
    pub fn elapsed_time(&self) -> f64 {
        self.core.elapsed()
    }

    /// The calling thread's logical time: the running routine's seconds,
    /// else the time a clock set for the task it is running, else elapsed.
    pub fn current_logical_time(&self) -> f64 {
        context::logical_seconds().unwrap_or_else(|| self.elapsed_time())
    }

    /// Pin the calling thread's root logical time to `seconds`, or to
    /// elapsed time when `None`.
    pub fn update_logical_time(&self, seconds: Option<f64>) {
        let seconds = seconds.unwrap_or_else(|| self.elapsed_time());
        context::set_logical_seconds(Some(seconds));
    }

    /// NTP 32.32 timestamp for elapsed `seconds`.
    pub fn elapsed_time_to_wire(&self, seconds: f64) -> u64 {
        self.core.to_wire(seconds)
    }

    pub fn wire_to_elapsed_time(&self, wire: u64) -> f64 {
        self.core.from_wire(wire)
    }

    /// Bundle timestamp for elapsed `seconds`.
    pub fn osc_time(&self, seconds: f64) -> OscTime {
        let wire = self.elapsed_time_to_wire(seconds);
        OscTime::from(((wire >> 32) as u32, wire as u32))
    }

    pub fn osc_time_to_elapsed(&self, time: OscTime) -> f64 {
        let wire = ((time.seconds as u64) << 32) | time.fractional as u64;
        self.wire_to_elapsed_time(wire)
    }

    /// The drift-free physical-time clock.
    pub fn system_clock(&self) -> Result<Clock> {
        self.singleton(&self.system, ClockKind::System, "SystemClock")
    }

    /// The drift-tolerant physical-time clock.
    pub fn app_clock(&self) -> Result<Clock> {
        self.singleton(&self.app, ClockKind::App, "AppClock")
    }

    fn singleton(&self, slot: &Mutex<Option<Clock>>, kind: ClockKind, name: &str) -> Result<Clock> {
        let mut slot = slot.lock();
        if let Some(clock) = slot.as_ref().filter(|c| c.is_running()) {
            return Ok(clock.clone());
        }
        let clock = self.create_clock(kind, name.to_string(), TempoMap::identity())?;
        *slot = Some(clock.clone());
        Ok(clock)
    }

    /// New tempo clock at `tempo` beats per second, anchored at beat zero now.
    pub fn tempo_clock(&self, tempo: f64) -> Result<TempoClock> {
        let mut options = TempoClockOptions::new(tempo);
        options.beats_per_bar = self.core.config.default_beats_per_bar;
        self.new_tempo_clock(options)
    }

    /// New tempo clock at the configured default tempo.
    pub fn default_tempo_clock(&self) -> Result<TempoClock> {
        self.tempo_clock(self.core.config.default_tempo)
    }

    pub fn new_tempo_clock(&self, options: TempoClockOptions) -> Result<TempoClock> {
        if !options.tempo.is_finite() || options.tempo <= 0.0 {
            return Err(ClockError::InvalidTempo(options.tempo));
        }
        if !options.beats_per_bar.is_finite() || options.beats_per_bar <= 0.0 {
            return Err(ClockError::InvalidMeter(options.beats_per_bar));
        }
        if !options.beats.is_finite() {
            return Err(ClockError::InvalidTime(options.beats));
        }
        let seconds = options
            .seconds
            .unwrap_or_else(|| self.current_logical_time());
        let map = TempoMap::new(options.tempo, options.beats, seconds, options.beats_per_bar);
        let name = options.name.unwrap_or_else(|| "TempoClock".to_string());
        let clock = self.create_clock(ClockKind::Tempo, name, map)?;
        let clock = TempoClock::from_clock(clock);
        clock.set_permanent(options.permanent);
        Ok(clock)
    }

    fn create_clock(&self, kind: ClockKind, name: String, map: TempoMap) -> Result<Clock> {
        let shared = ClockShared::new(kind, name, map, Arc::clone(&self.core));
        shared.start()?;
        let mut clocks = self.clocks.lock();
        clocks.retain(|w| w.strong_count() > 0);
        clocks.push(Arc::downgrade(&shared));
        Ok(Clock::from_shared(shared))
    }

    fn live_clocks(&self) -> Vec<Clock> {
        self.clocks
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_running())
            .map(Clock::from_shared)
            .collect()
    }

    /// Running tempo clocks of this authority.
    pub fn tempo_clocks(&self) -> Vec<TempoClock> {
        self.live_clocks()
            .into_iter()
            .filter(|c| c.kind() == ClockKind::Tempo)
            .map(TempoClock::from_clock)
            .collect()
    }

    /// Stop every non-permanent tempo clock. Returns how many stopped.
    pub fn stop_all_tempo_clocks(&self) -> usize {
        let mut stopped = 0;
        for clock in self.tempo_clocks() {
            if !clock.is_permanent() {
                clock.stop();
                stopped += 1;
            }
        }
        stopped
    }

    /// Run `hook` on every `abort_all`.
    pub fn on_abort(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.abort_hooks.lock().push(Box::new(hook));
    }

    /// Panic button: empty the system and app clocks, stop non-permanent
    /// tempo clocks, then run the abort hooks.
    pub fn abort_all(&self) {
        for slot in [&self.system, &self.app] {
            let clock = slot.lock().clone();
            if let Some(clock) = clock {
                clock.clear();
            }
        }
        let stopped = self.stop_all_tempo_clocks();
        let hooks = self.abort_hooks.lock();
        for hook in hooks.iter() {
            hook();
        }
        info!(stopped, hooks = hooks.len(), "abort");
    }

    /// Stop every clock, permanent ones included.
    pub fn shutdown(&self) {
        let system = self.system.lock().take();
        let app = self.app.lock().take();
        for clock in system.into_iter().chain(app) {
            clock.stop();
        }
        let clocks: Vec<Arc<ClockShared>> = self
            .clocks
            .lock()
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        for clock in clocks {
            clock.stop();
        }
    }

    fn require_offline(&self) -> Result<()> {
        match self.mode() {
            SchedulerMode::Offline => Ok(()),
            SchedulerMode::Realtime => Err(ClockError::WrongMode("offline")),
        }
    }

    /// Offline: move virtual time forward by `dt`, running everything due.
    /// Returns the number of clock slices processed.
    pub fn advance(&self, dt: f64) -> Result<usize> {
        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        self.advance_to(self.core.offline.seconds() + dt)
    }

    /// Offline: move virtual time to `seconds`, running everything due.
    pub fn advance_to(&self, seconds: f64) -> Result<usize> {
        self.require_offline()?;
        if seconds.is_nan() {
            return Err(ClockError::InvalidTime(seconds));
        }
        Ok(self
            .core
            .offline
            .advance_to(seconds, self.core.config.max_offline_slices))
    }

    /// Offline: keep advancing until no clock has anything queued.
    pub fn run_until_idle(&self) -> Result<usize> {
        self.require_offline()?;
        Ok(self
            .core
            .offline
            .run_until_idle(self.core.config.max_offline_slices))
    }

    /// Offline: time of the next queued entry across all clocks.
    pub fn next_event_time(&self) -> Option<f64> {
        self.core.offline.next_event_time()
    }

    /// Offline: see `ClockScheduler::set_recursive`.
    pub fn set_recursive(&self, recursive: bool) {
        self.core.offline.set_recursive(recursive);
    }
}

impl Drop for TimeAuthority {
    fn drop(&mut self) {
        self.shutdown();
    }
}
