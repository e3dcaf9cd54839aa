//! Routines - resumable computations driven by clocks
//!
//! A routine body is a hand-written state machine: each call to
//! `RoutineBody::resume` runs until the next suspension point and reports
//! what happened as a `Step`. Control signals (yield, yield-and-reset,
//! always-yield, stop) are part of that return value, never errors.

use crate::clock::{Clock, ClockId};
use crate::context;
use crate::engine::ClockShared;
use crate::error::{ClockError, Result};
use crate::rng::{DetRng, SharedRng};
use parking_lot::Mutex;
use rand::distributions::uniform::{SampleRange, SampleUniform};
use rand::Rng;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_task_id() -> TaskId {
    TASK_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

pub type TaskId = u64;

/// A value passed into or out of a routine.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// The reschedule delay this value stands for, if any.
    /// Only numbers count; booleans are not delays.
    pub fn as_delay(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// What a routine body did when it was resumed.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Suspend, handing the value to the caller.
    Yield(Value),
    /// Suspend with the value; the next resume starts a fresh body.
    YieldAndReset(Value),
    /// Finish; every later resume returns the value again.
    AlwaysYield(Value),
    /// Finish by the routine's own request.
    Stop,
    /// The body ran to completion.
    Done,
}

impl Step {
    pub fn wait(delta: f64) -> Self {
        Step::Yield(Value::Float(delta))
    }
}

/// Result of driving a routine once.
#[derive(Clone, Debug, PartialEq)]
pub enum Resumed {
    Yielded(Value),
    Finished(Value),
}

impl Resumed {
    pub fn value(&self) -> &Value {
        match self {
            Resumed::Yielded(v) | Resumed::Finished(v) => v,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Resumed::Finished(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutineState {
    Init,
    Running,
    Suspended,
    Done,
}

/// The resumable part of a routine.
pub trait RoutineBody: Send + 'static {
    fn resume(&mut self, cx: &mut RoutineCx<'_>, input: Value) -> anyhow::Result<Step>;
}

impl<F> RoutineBody for F
where
    F: FnMut(&mut RoutineCx<'_>, Value) -> anyhow::Result<Step> + Send + 'static,
{
    fn resume(&mut self, cx: &mut RoutineCx<'_>, input: Value) -> anyhow::Result<Step> {
        self(cx, input)
    }
}

/// What a body sees while it runs.
pub struct RoutineCx<'a> {
    routine: &'a Routine,
    seconds: f64,
    clock: Option<Clock>,
}

impl RoutineCx<'_> {
    pub fn this(&self) -> &Routine {
        self.routine
    }

    /// Logical time of this resumption.
    pub fn seconds(&self) -> f64 {
        self.seconds
    }

    pub fn beats(&self) -> f64 {
        match &self.clock {
            Some(clock) => clock.secs2beats(self.seconds),
            None => self.seconds,
        }
    }

    pub fn clock(&self) -> Option<&Clock> {
        self.clock.as_ref()
    }

    /// Uniform in [0, 1) from the routine's generator.
    pub fn random(&self) -> f64 {
        self.routine.rng().lock().random()
    }

    pub fn rand_range<T, R>(&self, range: R) -> T
    where
        T: SampleUniform,
        R: SampleRange<T>,
    {
        self.routine.rng().lock().gen_range(range)
    }
}

type BodyFactory = Arc<dyn Fn() -> Box<dyn RoutineBody> + Send + Sync>;

struct RoutineInner {
    name: Option<String>,
    state: RoutineState,
    body: Option<Box<dyn RoutineBody>>,
    /// Value replayed after `Step::AlwaysYield`.
    terminal: Option<Value>,
    seconds: f64,
    clock: Option<Clock>,
    parent: Option<Weak<RoutineShared>>,
    rng: SharedRng,
    running_on: Option<ThreadId>,
    stop_requested: bool,
}

pub(crate) struct RoutineShared {
    id: TaskId,
    factory: BodyFactory,
    inner: Mutex<RoutineInner>,
    slot: QueueSlot,
}

/// Handle to a routine. Clones refer to the same routine.
#[derive(Clone)]
pub struct Routine(Arc<RoutineShared>);

impl Routine {
    /// Build a routine from a body factory. The factory runs on first
    /// resume and again after every reset.
    pub fn new<F, B>(factory: F) -> Self
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: RoutineBody,
    {
        let factory: BodyFactory = Arc::new(move || Box::new(factory()) as Box<dyn RoutineBody>);
        let seconds = context::logical_seconds().unwrap_or(0.0);
        Routine(Arc::new(RoutineShared {
            id: next_task_id(),
            factory,
            inner: Mutex::new(RoutineInner {
                name: None,
                state: RoutineState::Init,
                body: None,
                terminal: None,
                seconds,
                clock: None,
                parent: None,
                rng: context::current_rng(),
                running_on: None,
                stop_requested: false,
            }),
            slot: QueueSlot::default(),
        }))
    }

    /// Build a routine from a closure; resets restart from a clone of it.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut(&mut RoutineCx<'_>, Value) -> anyhow::Result<Step> + Clone + Send + Sync + 'static,
    {
        Self::new(move || f.clone())
    }

    pub fn named(self, name: impl Into<String>) -> Self {
        self.0.inner.lock().name = Some(name.into());
        self
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> String {
        self.0
            .inner
            .lock()
            .name
            .clone()
            .unwrap_or_else(|| format!("routine#{}", self.0.id))
    }

    pub fn state(&self) -> RoutineState {
        self.0.inner.lock().state
    }

    /// Logical time of the latest resumption.
    pub fn seconds(&self) -> f64 {
        self.0.inner.lock().seconds
    }

    pub fn beats(&self) -> f64 {
        let (seconds, clock) = {
            let inner = self.0.inner.lock();
            (inner.seconds, inner.clock.clone())
        };
        match clock {
            Some(clock) => clock.secs2beats(seconds),
            None => seconds,
        }
    }

    pub fn clock(&self) -> Option<Clock> {
        self.0.inner.lock().clock.clone()
    }

    /// The routine that resumed this one most recently.
    pub fn parent(&self) -> Option<Routine> {
        self.0
            .inner
            .lock()
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Routine)
    }

    pub fn rng(&self) -> SharedRng {
        self.0.inner.lock().rng.clone()
    }

    /// Give this routine its own generator. Until called, the generator is
    /// shared with the context that created the routine.
    pub fn reseed(&self, seed: &str) {
        self.0.inner.lock().rng = DetRng::new(seed).shared();
    }

    pub fn reseed_u64(&self, seed: u64) {
        self.0.inner.lock().rng = DetRng::from_u64(seed).shared();
    }

    /// Run the body until its next suspension point.
    pub fn resume(&self, input: impl Into<Value>) -> Result<Resumed> {
        let input = input.into();
        let frame = context::resume_frame();

        let mut body = {
            let mut inner = self.0.inner.lock();
            match inner.state {
                RoutineState::Done => {
                    return match &inner.terminal {
                        Some(v) => Ok(Resumed::Finished(v.clone())),
                        None => Err(ClockError::AlreadyStopped(self.0.id)),
                    };
                }
                RoutineState::Running => return Err(ClockError::AlreadyRunning(self.0.id)),
                RoutineState::Init | RoutineState::Suspended => {}
            }
            let body = match inner.body.take() {
                Some(body) => body,
                None => (self.0.factory)(),
            };
            inner.state = RoutineState::Running;
            inner.seconds = frame.seconds;
            inner.clock = frame.clock.clone();
            inner.parent = frame.parent.as_ref().map(|p| Arc::downgrade(&p.0));
            inner.running_on = Some(thread::current().id());
            body
        };

        let guard = RunGuard::enter(self);
        let mut cx = RoutineCx {
            routine: self,
            seconds: frame.seconds,
            clock: frame.clock,
        };
        let outcome = body.resume(&mut cx, input);
        guard.finish();

        let mut discarded = None;
        let result = {
            let mut inner = self.0.inner.lock();
            inner.running_on = None;
            let stop_requested = std::mem::take(&mut inner.stop_requested);
            match outcome {
                Ok(_) if stop_requested => {
                    inner.state = RoutineState::Done;
                    inner.terminal = None;
                    discarded = Some(body);
                    Ok(Resumed::Finished(Value::Nil))
                }
                Ok(Step::Yield(v)) => {
                    inner.state = RoutineState::Suspended;
                    inner.body = Some(body);
                    Ok(Resumed::Yielded(v))
                }
                Ok(Step::YieldAndReset(v)) => {
                    inner.state = RoutineState::Init;
                    discarded = Some(body);
                    Ok(Resumed::Yielded(v))
                }
                Ok(Step::AlwaysYield(v)) => {
                    inner.state = RoutineState::Done;
                    inner.terminal = Some(v.clone());
                    discarded = Some(body);
                    Ok(Resumed::Finished(v))
                }
                Ok(Step::Stop) | Ok(Step::Done) => {
                    inner.state = RoutineState::Done;
                    inner.terminal = None;
                    discarded = Some(body);
                    Ok(Resumed::Finished(Value::Nil))
                }
                Err(cause) => {
                    inner.state = RoutineState::Done;
                    inner.terminal = None;
                    discarded = Some(body);
                    Err(ClockError::TaskFailed {
                        task: self.0.id,
                        cause,
                    })
                }
            }
        };
        // Body destructors are the routine's cleanup; run them unlocked.
        drop(discarded);
        result
    }

    /// Return to `Init`; the next resume starts a fresh body.
    pub fn reset(&self) -> Result<()> {
        let discarded = {
            let mut inner = self.0.inner.lock();
            if inner.state == RoutineState::Running {
                return Err(ClockError::ResetWhileRunning(self.0.id));
            }
            inner.state = RoutineState::Init;
            inner.terminal = None;
            inner.body.take()
        };
        drop(discarded);
        Ok(())
    }

    /// Finish the routine and drop its continuation.
    ///
    /// A routine cannot stop itself this way; its body returns `Step::Stop`
    /// instead. A routine running elsewhere (another thread, or further
    /// down this thread's stack) stops when its current resumption returns.
    pub fn stop(&self) -> Result<()> {
        let discarded = {
            let mut inner = self.0.inner.lock();
            match inner.state {
                RoutineState::Done => return Ok(()),
                RoutineState::Running => {
                    if context::current_routine_id() == Some(self.0.id) {
                        return Err(ClockError::StopWhileRunning(self.0.id));
                    }
                    inner.stop_requested = true;
                    return Ok(());
                }
                RoutineState::Init | RoutineState::Suspended => {
                    inner.state = RoutineState::Done;
                    inner.terminal = None;
                    inner.body.take()
                }
            }
        };
        drop(discarded);
        if let Some(home) = self.0.slot.home() {
            home.remove_task(&TaskHandle::from(self.clone()));
        }
        Ok(())
    }

    /// Schedule on `clock` at its next grid point.
    pub fn play(&self, clock: &Clock, quant: impl Into<crate::clock::Quant>) -> Result<()> {
        clock.play(self.clone(), quant)
    }

    /// Iterate yielded values until the routine finishes or `limit` is hit.
    pub fn values(&self, limit: usize) -> Values {
        Values {
            routine: self.clone(),
            remaining: limit,
        }
    }

    /// Which thread is executing the body right now.
    pub fn running_on(&self) -> Option<ThreadId> {
        self.0.inner.lock().running_on
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("id", &self.0.id)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Routine {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Routine {}

/// Keeps the thread's routine stack straight, including when a body panics.
struct RunGuard<'a> {
    routine: &'a Routine,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn enter(routine: &'a Routine) -> Self {
        context::push_routine(routine.clone());
        Self {
            routine,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        context::pop_routine();
        if !self.finished {
            // Unwinding out of the body: the continuation is gone.
            let mut inner = self.routine.0.inner.lock();
            inner.state = RoutineState::Done;
            inner.running_on = None;
            inner.terminal = None;
        }
    }
}

pub struct Values {
    routine: Routine,
    remaining: usize,
}

impl Iterator for Values {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match self.routine.resume(Value::Nil) {
            Ok(Resumed::Yielded(v)) => Some(v),
            _ => None,
        }
    }
}

/// A schedulable plain function. A numeric return value reschedules it.
#[derive(Clone)]
pub struct FnTask(Arc<FnTaskShared>);

type TaskFn = Box<dyn FnMut(f64, f64, &Clock) -> anyhow::Result<Value> + Send>;

struct FnTaskShared {
    id: TaskId,
    name: String,
    func: Mutex<TaskFn>,
    slot: QueueSlot,
}

impl FnTask {
    /// `f(beats, seconds, clock)`
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(f64, f64, &Clock) -> anyhow::Result<Value> + Send + 'static,
    {
        let id = next_task_id();
        FnTask(Arc::new(FnTaskShared {
            id,
            name: format!("fn#{}", id),
            func: Mutex::new(Box::new(f)),
            slot: QueueSlot::default(),
        }))
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }
}

/// Anything a clock can hold in its queue.
pub trait Schedulable: Send + Sync + 'static {
    fn task_id(&self) -> TaskId;

    fn label(&self) -> String;

    /// Called by the clock at the scheduled time. A numeric result
    /// reschedules the task that many beats later.
    fn awake(&self, beats: f64, seconds: f64, clock: &Clock) -> anyhow::Result<Value>;

    fn queue_slot(&self) -> &QueueSlot;
}

impl Schedulable for Routine {
    fn task_id(&self) -> TaskId {
        self.0.id
    }

    fn label(&self) -> String {
        self.name()
    }

    fn awake(&self, beats: f64, _seconds: f64, _clock: &Clock) -> anyhow::Result<Value> {
        match self.resume(beats) {
            // An always-yield routine keeps handing back its terminal value.
            Ok(Resumed::Yielded(v)) | Ok(Resumed::Finished(v)) => Ok(v),
            // Stopped while queued.
            Err(ClockError::AlreadyStopped(_)) => Ok(Value::Nil),
            Err(ClockError::TaskFailed { cause, .. }) => Err(cause),
            Err(other) => Err(other.into()),
        }
    }

    fn queue_slot(&self) -> &QueueSlot {
        &self.0.slot
    }
}

impl Schedulable for FnTask {
    fn task_id(&self) -> TaskId {
        self.0.id
    }

    fn label(&self) -> String {
        self.0.name.clone()
    }

    fn awake(&self, beats: f64, seconds: f64, clock: &Clock) -> anyhow::Result<Value> {
        let mut func = self
            .0
            .func
            .try_lock()
            .ok_or(ClockError::AlreadyRunning(self.0.id))?;
        let f: &mut TaskFn = &mut func;
        f(beats, seconds, clock)
    }

    fn queue_slot(&self) -> &QueueSlot {
        &self.0.slot
    }
}

/// Queue entry handle. Equality and hashing go by task id.
#[derive(Clone)]
pub struct TaskHandle(Arc<dyn Schedulable>);

impl TaskHandle {
    pub fn new(task: impl Schedulable) -> Self {
        TaskHandle(Arc::new(task))
    }

    pub fn id(&self) -> TaskId {
        self.0.task_id()
    }

    pub fn label(&self) -> String {
        self.0.label()
    }

    pub(crate) fn awake(&self, beats: f64, seconds: f64, clock: &Clock) -> anyhow::Result<Value> {
        self.0.awake(beats, seconds, clock)
    }

    pub(crate) fn slot(&self) -> &QueueSlot {
        self.0.queue_slot()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TaskHandle {}

impl Hash for TaskHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskHandle({})", self.label())
    }
}

impl From<Routine> for TaskHandle {
    fn from(r: Routine) -> Self {
        TaskHandle::new(r)
    }
}

impl From<&Routine> for TaskHandle {
    fn from(r: &Routine) -> Self {
        TaskHandle::new(r.clone())
    }
}

impl From<FnTask> for TaskHandle {
    fn from(f: FnTask) -> Self {
        TaskHandle::new(f)
    }
}

impl From<&FnTask> for TaskHandle {
    fn from(f: &FnTask) -> Self {
        TaskHandle::new(f.clone())
    }
}

/// Records which clock queue, if any, holds a task.
#[derive(Default)]
pub struct QueueSlot {
    home: Mutex<Option<(ClockId, Weak<ClockShared>)>>,
}

impl QueueSlot {
    pub fn clock_id(&self) -> Option<ClockId> {
        self.home.lock().as_ref().map(|(id, _)| *id)
    }

    pub(crate) fn home(&self) -> Option<Arc<ClockShared>> {
        self.home.lock().as_ref().and_then(|(_, w)| w.upgrade())
    }

    /// Point the slot at `clock`, returning the previous clock if it was a
    /// different one.
    pub(crate) fn claim(&self, clock: &Arc<ClockShared>) -> Option<Arc<ClockShared>> {
        let prev = self
            .home
            .lock()
            .replace((clock.id, Arc::downgrade(clock)));
        prev.filter(|(id, _)| *id != clock.id)
            .and_then(|(_, w)| w.upgrade())
    }

    /// Clear the slot if it still points at `clock_id`.
    pub(crate) fn release(&self, clock_id: ClockId) {
        let mut home = self.home.lock();
        if matches!(home.as_ref(), Some((id, _)) if *id == clock_id) {
            *home = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::TimeAuthority;
    use crate::clock::ClockKind;
    use crate::config::EngineConfig;
    use std::sync::atomic::AtomicUsize;

    fn counter_routine(limit: i64) -> Routine {
        Routine::new(move || {
            let mut n = 0i64;
            move |_cx: &mut RoutineCx<'_>, _input: Value| {
                n += 1;
                if n > limit {
                    Ok(Step::Done)
                } else {
                    Ok(Step::Yield(Value::Int(n)))
                }
            }
        })
    }

    #[test]
    fn test_state_machine() {
        let r = counter_routine(2);
        assert_eq!(r.state(), RoutineState::Init);

        assert_eq!(r.resume(()).unwrap(), Resumed::Yielded(Value::Int(1)));
        assert_eq!(r.state(), RoutineState::Suspended);
        assert_eq!(r.resume(()).unwrap(), Resumed::Yielded(Value::Int(2)));
        assert_eq!(r.resume(()).unwrap(), Resumed::Finished(Value::Nil));
        assert_eq!(r.state(), RoutineState::Done);

        for _ in 0..3 {
            assert!(matches!(r.resume(()), Err(ClockError::AlreadyStopped(_))));
        }
    }

    #[test]
    fn test_always_yield_replays() {
        let r = Routine::from_fn(|_cx: &mut RoutineCx<'_>, _in: Value| {
            Ok(Step::AlwaysYield(Value::from("end")))
        });
        for _ in 0..3 {
            assert_eq!(r.resume(()).unwrap(), Resumed::Finished(Value::from("end")));
        }
        assert_eq!(r.state(), RoutineState::Done);
    }

    #[test]
    fn test_reset_restarts_body() {
        let r = counter_routine(5);
        r.resume(()).unwrap();
        r.resume(()).unwrap();
        r.reset().unwrap();
        assert_eq!(r.state(), RoutineState::Init);
        assert_eq!(r.resume(()).unwrap(), Resumed::Yielded(Value::Int(1)));
    }

    #[test]
    fn test_yield_and_reset() {
        let r = Routine::new(|| {
            let mut n = 0;
            move |_cx: &mut RoutineCx<'_>, _in: Value| {
                n += 1;
                if n == 2 {
                    Ok(Step::YieldAndReset(Value::Int(n)))
                } else {
                    Ok(Step::Yield(Value::Int(n)))
                }
            }
        });
        let seen: Vec<Value> = r.values(5).collect();
        assert_eq!(
            seen,
            vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(1),
                Value::Int(2),
                Value::Int(1)
            ]
        );
    }

    #[test]
    fn test_stop_from_outside_drops_body() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct Noisy(Arc<AtomicUsize>);
        impl Drop for Noisy {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let d = drops.clone();
        let r = Routine::new(move || {
            let noisy = Noisy(d.clone());
            move |_cx: &mut RoutineCx<'_>, _in: Value| {
                let _keep = &noisy;
                Ok(Step::wait(1.0))
            }
        });
        r.resume(()).unwrap();
        r.stop().unwrap();
        assert_eq!(r.state(), RoutineState::Done);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(matches!(r.resume(()), Err(ClockError::AlreadyStopped(_))));
    }

    #[test]
    fn test_self_stop_and_reset_rejected() {
        let r = Routine::from_fn(|cx: &mut RoutineCx<'_>, _in: Value| {
            assert!(matches!(
                cx.this().stop(),
                Err(ClockError::StopWhileRunning(_))
            ));
            assert!(matches!(
                cx.this().reset(),
                Err(ClockError::ResetWhileRunning(_))
            ));
            assert!(matches!(
                cx.this().resume(()),
                Err(ClockError::AlreadyRunning(_))
            ));
            Ok(Step::Stop)
        });
        assert_eq!(r.resume(()).unwrap(), Resumed::Finished(Value::Nil));
        assert_eq!(r.state(), RoutineState::Done);
    }

    #[test]
    fn test_body_error_finishes_routine() {
        let r = Routine::from_fn(|_cx: &mut RoutineCx<'_>, _in: Value| {
            Err(anyhow::anyhow!("boom"))
        });
        match r.resume(()) {
            Err(ClockError::TaskFailed { task, cause }) => {
                assert_eq!(task, r.id());
                assert_eq!(cause.to_string(), "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.state(), RoutineState::Done);
    }

    #[test]
    fn test_parent_stops_child_running_below() {
        // The child stops its parent; the parent finishes once it returns.
        let parent_slot: Arc<Mutex<Option<Routine>>> = Arc::new(Mutex::new(None));
        let slot = parent_slot.clone();
        let parent = Routine::from_fn(move |_cx: &mut RoutineCx<'_>, _in: Value| {
            let slot = slot.clone();
            let child = Routine::from_fn(move |_cx: &mut RoutineCx<'_>, _in: Value| {
                if let Some(p) = slot.lock().as_ref() {
                    p.stop()?;
                }
                Ok(Step::Done)
            });
            child.resume(())?;
            Ok(Step::wait(1.0))
        });
        *parent_slot.lock() = Some(parent.clone());

        assert_eq!(parent.resume(()).unwrap(), Resumed::Finished(Value::Nil));
        assert_eq!(parent.state(), RoutineState::Done);
    }

    #[test]
    fn test_child_sees_parent_and_time() {
        let seen: Arc<Mutex<Vec<(f64, Option<TaskId>)>>> = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let outer = Routine::from_fn(move |cx: &mut RoutineCx<'_>, _in: Value| {
            let s = s.clone();
            let child = Routine::from_fn(move |cx: &mut RoutineCx<'_>, _in: Value| {
                s.lock()
                    .push((cx.seconds(), cx.this().parent().map(|p| p.id())));
                Ok(Step::Done)
            });
            child.resume(())?;
            let _ = cx.seconds();
            Ok(Step::Done)
        });
        let _frame = context::enter_clock(7.5, None);
        outer.resume(()).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 7.5);
        assert_eq!(seen[0].1, Some(outer.id()));
    }

    #[test]
    fn test_rng_inherited_until_reseed() {
        context::reseed_thread("rng-inherit");

        // Two routines created at the root share the thread generator.
        let a = Routine::from_fn(|cx: &mut RoutineCx<'_>, _in: Value| {
            Ok(Step::Yield(Value::Float(cx.random())))
        });
        let b = Routine::from_fn(|cx: &mut RoutineCx<'_>, _in: Value| {
            Ok(Step::Yield(Value::Float(cx.random())))
        });
        let va = a.resume(()).unwrap();
        let vb = b.resume(()).unwrap();

        let mut reference = DetRng::new("rng-inherit");
        assert_eq!(va.value(), &Value::Float(reference.random()));
        assert_eq!(vb.value(), &Value::Float(reference.random()));

        // After reseeding, b draws from its own stream.
        b.reseed("own");
        let vb = b.resume(()).unwrap();
        assert_eq!(vb.value(), &Value::Float(DetRng::new("own").random()));
    }

    #[test]
    fn test_value_delays() {
        assert_eq!(Value::Int(2).as_delay(), Some(2.0));
        assert_eq!(Value::Float(0.5).as_delay(), Some(0.5));
        assert_eq!(Value::Bool(true).as_delay(), None);
        assert_eq!(Value::Nil.as_delay(), None);
        assert_eq!(Value::from("x").as_delay(), None);
    }

    fn offline_system_clock() -> (TimeAuthority, Clock) {
        let authority = TimeAuthority::new(EngineConfig::offline());
        let clock = authority.system_clock().unwrap();
        (authority, clock)
    }

    #[test]
    fn test_fn_task_awake() {
        let (_authority, clock) = offline_system_clock();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = FnTask::new(move |beats, secs, clock| {
            h.fetch_add(1, Ordering::SeqCst);
            assert_eq!(clock.kind(), ClockKind::System);
            Ok(Value::Float(beats + secs))
        });
        let handle = TaskHandle::from(&task);
        assert_eq!(handle.id(), task.id());
        assert_eq!(handle, TaskHandle::from(task.clone()));

        assert_eq!(handle.awake(1.0, 2.0, &clock).unwrap(), Value::Float(3.0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(handle.awake(0.5, 0.0, &clock).unwrap(), Value::Float(0.5));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fn_task_reentrant_awake_rejected() {
        let (_authority, clock) = offline_system_clock();
        let own: Arc<Mutex<Option<TaskHandle>>> = Arc::default();
        let nested: Arc<Mutex<Option<bool>>> = Arc::default();

        let (o, n) = (own.clone(), nested.clone());
        let task = FnTask::new(move |beats, secs, clock| {
            let me = o.lock().take();
            if let Some(me) = me {
                let err = me.awake(beats, secs, clock).unwrap_err();
                *n.lock() = Some(matches!(
                    err.downcast_ref::<ClockError>(),
                    Some(ClockError::AlreadyRunning(_))
                ));
            }
            Ok(Value::Int(1))
        });
        let handle = TaskHandle::from(&task);
        *own.lock() = Some(handle.clone());

        assert_eq!(handle.awake(0.0, 0.0, &clock).unwrap(), Value::Int(1));
        assert_eq!(*nested.lock(), Some(true));
    }

    #[test]
    fn test_always_yield_routine_keeps_its_delay() {
        let (_authority, clock) = offline_system_clock();
        let r = Routine::from_fn(|_cx: &mut RoutineCx<'_>, _in: Value| {
            Ok(Step::AlwaysYield(Value::Float(0.5)))
        });
        let handle = TaskHandle::from(&r);
        for _ in 0..3 {
            assert_eq!(handle.awake(0.0, 0.0, &clock).unwrap(), Value::Float(0.5));
        }
        assert_eq!(r.state(), RoutineState::Done);

        let stopped = counter_routine(0);
        stopped.resume(()).unwrap();
        assert_eq!(TaskHandle::from(&stopped).awake(0.0, 0.0, &clock).unwrap(), Value::Nil);
    }
}
