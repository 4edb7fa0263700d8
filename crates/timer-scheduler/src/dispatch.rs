//! Dispatch routing for due timers
//!
//! The scheduler never runs a callback on its own task. A due timer is handed
//! to a [`Dispatcher`] together with its route, and the dispatcher executes
//! it under its own model.

use crate::timer::Timer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Where a due timer's invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRoute {
    /// The embedder's main loop, fed through a queue it drains itself.
    Main,
    /// A generic worker task.
    Worker,
}

/// Executes due timers outside the scheduler's critical section.
///
/// Ownership of the strong handle transfers with the call; an invocation
/// already handed over cannot be cancelled.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, route: DispatchRoute, timer: Arc<Timer>);
}

/// Default dispatcher: worker-routed timers run on freshly spawned tasks,
/// main-routed timers are queued for the embedder.
pub struct TokioDispatcher {
    main_tx: mpsc::UnboundedSender<Arc<Timer>>,
}

impl TokioDispatcher {
    /// Build a dispatcher that forwards main-routed timers over `main_tx`.
    ///
    /// The embedder holds the receiving end and invokes those timers on its
    /// own loop; once the receiver is dropped, main-routed invocations are
    /// silently discarded.
    pub fn new(main_tx: mpsc::UnboundedSender<Arc<Timer>>) -> Self {
        Self { main_tx }
    }
}

impl Dispatcher for TokioDispatcher {
    fn dispatch(&self, route: DispatchRoute, timer: Arc<Timer>) {
        match route {
            DispatchRoute::Main => {
                if self.main_tx.send(timer).is_err() {
                    debug!("main dispatch queue closed, dropping timer invocation");
                }
            }
            DispatchRoute::Worker => {
                tokio::spawn(async move {
                    timer.invoke();
                });
            }
        }
    }
}
