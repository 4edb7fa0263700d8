//! Timer objects
//!
//! A timer is created and owned by its caller; the scheduler only ever holds
//! a weak handle to it. The owner keeps the timer firing by keeping the
//! strong handle alive and cancels it implicitly by dropping it.

use chrono::Utc;
use std::sync::{Arc, Mutex};

/// Floor applied to a recurring timer's re-arm interval.
pub const MIN_TIMER_INTERVAL_SECS: f64 = 0.01;

/// Current wall-clock time as fractional epoch seconds.
pub(crate) fn epoch_seconds_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// One scheduled invocation.
///
/// `next_signal` is the epoch-seconds deadline of the next fire. The
/// scheduler moves it forward on every re-arm of a recurring timer; it is
/// never read while an await is pending, so a plain sync lock guards it.
pub struct Timer {
    interval_secs: f64,
    recurring: bool,
    invoke_on_main: bool,
    next_signal: Mutex<f64>,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl Timer {
    /// Build a timer due `interval_secs` from now.
    pub fn new(
        interval_secs: f64,
        recurring: bool,
        invoke_on_main: bool,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            interval_secs,
            recurring,
            invoke_on_main,
            next_signal: Mutex::new(epoch_seconds_now() + interval_secs),
            callback: Box::new(callback),
        })
    }

    /// Epoch seconds of the next scheduled fire.
    pub fn next_signal(&self) -> f64 {
        *self.next_signal.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move the next scheduled fire.
    pub fn set_next_signal(&self, epoch_secs: f64) {
        *self.next_signal.lock().unwrap_or_else(|e| e.into_inner()) = epoch_secs;
    }

    /// Seconds between recurring fires.
    pub fn interval_secs(&self) -> f64 {
        self.interval_secs
    }

    /// Whether the timer re-arms after firing.
    pub fn recurring(&self) -> bool {
        self.recurring
    }

    /// Whether invocations route to the embedder's main loop.
    pub fn invoke_on_main(&self) -> bool {
        self.invoke_on_main
    }

    /// Run the payload.
    pub fn invoke(&self) {
        (self.callback)();
    }
}
