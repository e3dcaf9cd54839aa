//! Logical Clocks
//!
//! Logical-time clocks and cooperative scheduling:
//! - Drift-free rescheduling (a task's next time is computed from its
//!   scheduled time, never from when it actually ran)
//! - Resumable routines with per-thread logical time and seeded randomness
//! - Tempo clocks with interactive tempo and meter changes
//! - Dual execution modes: realtime (worker threads, spin_sleep) and
//!   offline (a shared virtual timeline stepped by the caller)

pub mod pq;
pub mod tempo;
pub mod rng;
pub mod error;
pub mod config;
pub mod task;
pub mod context;
pub mod scheduler;
mod engine;
pub mod clock;
pub mod authority;


pub use authority::TimeAuthority;
pub use clock::{Clock, ClockId, ClockKind, EnginePhase, Quant, TempoClock, TempoClockOptions};
pub use config::{load_dotenv, EngineConfig};
pub use error::{ClockError, Result};
pub use pq::TaskQueue;
pub use scheduler::{ClockScheduler, SchedulerMode};
pub use task::{FnTask, Resumed, Routine, RoutineBody, RoutineCx, RoutineState, Schedulable, Step, TaskHandle, TaskId, Value};
pub use tempo::TempoMap;
