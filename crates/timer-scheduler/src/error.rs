//! Error types for the timer scheduler

use std::fmt;

#[derive(Debug)]
pub enum SchedulerError {
    AlreadyRunning,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::AlreadyRunning => {
                write!(f, "A timer scheduler is already running in this process")
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

pub type Result<T> = std::result::Result<T, SchedulerError>;
