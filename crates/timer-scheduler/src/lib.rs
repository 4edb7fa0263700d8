//! Concurrent timer scheduler
//!
//! Fires one-shot and recurring callbacks through an injected dispatcher.
//! Timers are owned by their creators; the scheduler keeps only weak handles,
//! so dropping every strong handle cancels a timer without an explicit stop.

pub mod dispatch;
pub mod error;
pub mod scheduler;
pub mod timer;

pub use dispatch::{DispatchRoute, Dispatcher, TokioDispatcher};
pub use error::{Result, SchedulerError};
pub use scheduler::TimerScheduler;
pub use timer::{Timer, MIN_TIMER_INTERVAL_SECS};
