use thiserror::Error;

use crate::task::TaskId;

#[derive(Error, Debug)]
pub enum ClockError {
    #[error("queue is empty")]
    EmptyQueue,

    #[error("routine {0} already stopped")]
    AlreadyStopped(TaskId),

    #[error("routine {0} is already running")]
    AlreadyRunning(TaskId),

    #[error("routine {0} cannot reset itself while running")]
    ResetWhileRunning(TaskId),

    #[error("routine {0} must stop itself by returning Step::Stop")]
    StopWhileRunning(TaskId),

    #[error("invalid tempo {0}")]
    InvalidTempo(f64),

    #[error("invalid beats per bar {0}")]
    InvalidMeter(f64),

    #[error("invalid time {0}")]
    InvalidTime(f64),

    #[error("clock '{0}' may only be changed from one of its own tasks")]
    WrongSchedulingThread(String),

    #[error("clock '{0}' is not running")]
    EngineNotRunning(String),

    #[error("operation requires {0} mode")]
    WrongMode(&'static str),

    #[error("task {task} failed: {cause:#}")]
    TaskFailed { task: TaskId, cause: anyhow::Error },

    #[error("failed to start clock worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClockError>;
