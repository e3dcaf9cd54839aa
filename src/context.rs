//! Per-thread execution context
//!
//! Each thread carries the stack of routines it is currently resuming and a
//! root frame (logical seconds, clock, generator) that applies when no
//! routine is running. Clock drivers set the root frame before waking a
//! task, so code running inside a task sees the task's logical time.

use crate::authority::TimeAuthority;
use crate::clock::Clock;
use crate::rng::{DetRng, SharedRng};
use crate::task::{Routine, TaskId};
use std::cell::RefCell;

const ROOT_SEED: &str = "logical_clocks";

struct ThreadContext {
    stack: Vec<Routine>,
    root_seconds: Option<f64>,
    root_clock: Option<Clock>,
    root_rng: SharedRng,
}

thread_local! {
    static CONTEXT: RefCell<ThreadContext> = RefCell::new(ThreadContext {
        stack: Vec::new(),
        root_seconds: None,
        root_clock: None,
        root_rng: DetRng::new(ROOT_SEED).shared(),
    });
}

/// The routine running innermost on this thread.
pub fn current_routine() -> Option<Routine> {
    CONTEXT.with(|c| c.borrow().stack.last().cloned())
}

pub fn current_routine_id() -> Option<TaskId> {
    CONTEXT.with(|c| c.borrow().stack.last().map(|r| r.id()))
}

/// Logical time of this thread, if any code on it set one.
pub fn logical_seconds() -> Option<f64> {
    let (top, root) = CONTEXT.with(|c| {
        let c = c.borrow();
        (c.stack.last().cloned(), c.root_seconds)
    });
    match top {
        Some(routine) => Some(routine.seconds()),
        None => root,
    }
}

/// Clock whose task is running on this thread.
pub fn current_clock() -> Option<Clock> {
    let (top, root) = CONTEXT.with(|c| {
        let c = c.borrow();
        (c.stack.last().cloned(), c.root_clock.clone())
    });
    match top {
        Some(routine) => routine.clock().or(root),
        None => root,
    }
}

/// Generator new routines inherit.
pub fn current_rng() -> SharedRng {
    let (top, root) = CONTEXT.with(|c| {
        let c = c.borrow();
        (c.stack.last().cloned(), c.root_rng.clone())
    });
    match top {
        Some(routine) => routine.rng(),
        None => root,
    }
}

/// Replace this thread's root generator.
pub fn reseed_thread(seed: &str) {
    CONTEXT.with(|c| c.borrow_mut().root_rng = DetRng::new(seed).shared());
}

/// Pin (or with `None`, unpin) the root logical time of this thread.
pub fn set_logical_seconds(seconds: Option<f64>) {
    CONTEXT.with(|c| c.borrow_mut().root_seconds = seconds);
}

pub(crate) struct ResumeFrame {
    pub seconds: f64,
    pub clock: Option<Clock>,
    pub parent: Option<Routine>,
}

/// Time, clock and parent a routine inherits when resumed here.
pub(crate) fn resume_frame() -> ResumeFrame {
    let (top, root_seconds, root_clock) = CONTEXT.with(|c| {
        let c = c.borrow();
        (c.stack.last().cloned(), c.root_seconds, c.root_clock.clone())
    });
    if let Some(parent) = top {
        return ResumeFrame {
            seconds: parent.seconds(),
            clock: parent.clock(),
            parent: Some(parent),
        };
    }
    let seconds = match (root_seconds, &root_clock) {
        (Some(s), _) => s,
        (None, Some(clock)) => clock.elapsed_seconds(),
        (None, None) => TimeAuthority::global().elapsed_time(),
    };
    ResumeFrame {
        seconds,
        clock: root_clock,
        parent: None,
    }
}

pub(crate) fn push_routine(routine: Routine) {
    CONTEXT.with(|c| c.borrow_mut().stack.push(routine));
}

pub(crate) fn pop_routine() {
    CONTEXT.with(|c| {
        c.borrow_mut().stack.pop();
    });
}

/// Root frame installed while a clock wakes one task. Dropping it restores
/// the previous frame.
pub(crate) struct ClockFrame {
    prev_seconds: Option<f64>,
    prev_clock: Option<Clock>,
}

pub(crate) fn enter_clock(seconds: f64, clock: Option<Clock>) -> ClockFrame {
    CONTEXT.with(|c| {
        let mut c = c.borrow_mut();
        let prev_seconds = c.root_seconds.replace(seconds);
        let prev_clock = std::mem::replace(&mut c.root_clock, clock);
        ClockFrame {
            prev_seconds,
            prev_clock,
        }
    })
}

impl Drop for ClockFrame {
    fn drop(&mut self) {
        let seconds = self.prev_seconds.take();
        let clock = self.prev_clock.take();
        // The thread-local may already be gone during thread teardown.
        let _ = CONTEXT.try_with(|c| {
            let mut c = c.borrow_mut();
            c.root_seconds = seconds;
            c.root_clock = clock;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_frame_restores() {
        assert_eq!(logical_seconds(), None);
        {
            let _outer = enter_clock(1.0, None);
            assert_eq!(logical_seconds(), Some(1.0));
            {
                let _inner = enter_clock(2.0, None);
                assert_eq!(logical_seconds(), Some(2.0));
            }
            assert_eq!(logical_seconds(), Some(1.0));
        }
        assert_eq!(logical_seconds(), None);
    }

    #[test]
    fn test_pinned_seconds() {
        set_logical_seconds(Some(3.25));
        assert_eq!(logical_seconds(), Some(3.25));
        set_logical_seconds(None);
        assert_eq!(logical_seconds(), None);
    }

    #[test]
    fn test_reseed_thread() {
        reseed_thread("ctx");
        let a = current_rng().lock().next_u64();
        reseed_thread("ctx");
        let b = current_rng().lock().next_u64();
        assert_eq!(a, b);
    }
}
