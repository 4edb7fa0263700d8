//! Timer queue and coordinating task
//!
//! One process-wide scheduler owns a background task that sleeps until the
//! earliest deadline, drains every due timer through the dispatcher, and
//! re-arms recurring timers. The queue holds weak handles only: a timer
//! whose owner dropped it is discarded on the next pass, never invoked.

use crate::dispatch::{DispatchRoute, Dispatcher};
use crate::error::{Result, SchedulerError};
use crate::timer::{epoch_seconds_now, Timer, MIN_TIMER_INTERVAL_SECS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Wait between queue checks while no timers are scheduled.
const EMPTY_QUEUE_POLL: Duration = Duration::from_secs(1);

/// One live scheduler per process.
static SCHEDULER_LIVE: AtomicBool = AtomicBool::new(false);

struct SchedulerShared {
    queue: Mutex<Vec<Weak<Timer>>>,
    wake: Notify,
    shutdown: AtomicBool,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Process-wide timer scheduler.
///
/// Construction spawns the coordinating task; [`shutdown`](Self::shutdown)
/// stops and joins it deterministically. Only one scheduler may be live at
/// a time.
pub struct TimerScheduler {
    shared: Arc<SchedulerShared>,
    task: Option<JoinHandle<()>>,
}

impl TimerScheduler {
    /// Create the scheduler and spawn its coordinating task.
    ///
    /// Must be called inside a tokio runtime. Fails with
    /// [`SchedulerError::AlreadyRunning`] while another scheduler is live.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        if SCHEDULER_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let shared = Arc::new(SchedulerShared {
            queue: Mutex::new(Vec::new()),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            dispatcher,
        });
        let task = tokio::spawn(run(shared.clone()));

        Ok(Self {
            shared,
            task: Some(task),
        })
    }

    /// Build a timer due `interval_secs` from now and schedule it.
    ///
    /// The returned handle owns the timer: keep it alive for as long as the
    /// timer should keep firing, drop it to cancel implicitly.
    pub async fn start_timer(
        &self,
        interval_secs: f64,
        recurring: bool,
        invoke_on_main: bool,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Timer> {
        let timer = Timer::new(interval_secs, recurring, invoke_on_main, callback);
        self.insert_timer(&timer).await;
        timer
    }

    /// Schedule an existing timer at its current `next_signal`.
    pub async fn insert_timer(&self, timer: &Arc<Timer>) {
        let new_head = {
            let mut queue = self.shared.queue.lock().await;
            insert_sorted(&mut queue, timer)
        };

        // the task only needs a wake-up when its current deadline moved
        if new_head {
            self.shared.wake.notify_one();
        }
    }

    /// Remove a scheduled timer. Returns whether it was found in the queue.
    pub async fn stop_timer(&self, timer: &Arc<Timer>) -> bool {
        let mut queue = self.shared.queue.lock().await;
        let Some(idx) = queue
            .iter()
            .position(|slot| slot.upgrade().is_some_and(|t| Arc::ptr_eq(&t, timer)))
        else {
            return false;
        };
        queue.remove(idx);
        true
    }

    /// Unschedule every timer.
    pub async fn stop_all_timers(&self) {
        self.shared.queue.lock().await.clear();
    }

    /// Stop the coordinating task and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "timer task ended abnormally");
            }
        }
        debug!("timer scheduler shut down");
    }

    #[cfg(test)]
    async fn queue_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        if !self.shared.shutdown.swap(true, Ordering::SeqCst) {
            self.shared.wake.notify_one();
        }
        if self.task.is_some() {
            debug!("timer scheduler dropped without shutdown, task exits on next wake");
        }
        SCHEDULER_LIVE.store(false, Ordering::SeqCst);
    }
}

/// Coordinating task: sleep until the earliest deadline or a wake-up, then
/// drain every due timer.
async fn run(shared: Arc<SchedulerShared>) {
    debug!("timer task started");

    while !shared.shutdown.load(Ordering::SeqCst) {
        let wait = {
            let mut queue = shared.queue.lock().await;
            next_wait(&mut queue, shared.dispatcher.as_ref())
        };

        if let Some(duration) = wait {
            // woken early by a new earliest timer, shutdown, or the timeout
            let _ = tokio::time::timeout(duration, shared.wake.notified()).await;
        }
    }

    debug!("timer task stopped");
}

/// Inspect the queue head and return how long the task should wait before
/// the next check, draining due timers first. `None` means re-check
/// immediately.
fn next_wait(queue: &mut Vec<Weak<Timer>>, dispatcher: &dyn Dispatcher) -> Option<Duration> {
    loop {
        let Some(head) = queue.first() else {
            return Some(EMPTY_QUEUE_POLL);
        };
        let Some(timer) = head.upgrade() else {
            // owner dropped the timer, discard it without invoking
            queue.remove(0);
            continue;
        };

        let sleep_secs = timer.next_signal() - epoch_seconds_now();
        if sleep_secs > 0.0 {
            return Some(Duration::from_secs_f64(sleep_secs));
        }

        drain_due(queue, dispatcher);
        return None;
    }
}

/// Pop and dispatch every timer whose deadline has passed, re-arming
/// recurring timers as they go.
fn drain_due(queue: &mut Vec<Weak<Timer>>, dispatcher: &dyn Dispatcher) {
    let now = epoch_seconds_now();

    loop {
        let Some(head) = queue.first() else {
            break;
        };
        let Some(timer) = head.upgrade() else {
            queue.remove(0);
            continue;
        };
        if now < timer.next_signal() {
            break;
        }
        queue.remove(0);

        let route = if timer.invoke_on_main() {
            DispatchRoute::Main
        } else {
            DispatchRoute::Worker
        };
        dispatcher.dispatch(route, timer.clone());

        if timer.recurring() {
            // re-arm from the previous deadline so the cadence stays fixed
            let interval = timer.interval_secs().max(MIN_TIMER_INTERVAL_SECS);
            timer.set_next_signal(timer.next_signal() + interval);
            insert_sorted(queue, &timer);
        }
    }
}

/// Insert a timer keeping the queue sorted ascending by `next_signal`, after
/// any already-queued timer with the same deadline. Entries whose owner is
/// gone are skipped here; the coordinating task discards them. Returns
/// whether the timer became the new queue head.
fn insert_sorted(queue: &mut Vec<Weak<Timer>>, timer: &Arc<Timer>) -> bool {
    let next = timer.next_signal();

    let mut new_head = true;
    let mut insert_at = None;
    for (idx, slot) in queue.iter().enumerate() {
        let Some(existing) = slot.upgrade() else {
            continue;
        };
        if next < existing.next_signal() {
            insert_at = Some(idx);
            break;
        }
        new_head = false;
    }

    match insert_at {
        Some(idx) => queue.insert(idx, Arc::downgrade(timer)),
        None => queue.push(Arc::downgrade(timer)),
    }

    new_head
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    // one scheduler may be live per process, so tests that construct one
    // serialize on this lock
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    fn test_guard() -> std::sync::MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    struct InlineDispatcher;

    impl Dispatcher for InlineDispatcher {
        fn dispatch(&self, _route: DispatchRoute, timer: Arc<Timer>) {
            timer.invoke();
        }
    }

    struct RecordingDispatcher {
        routes: StdMutex<Vec<DispatchRoute>>,
    }

    impl Dispatcher for RecordingDispatcher {
        fn dispatch(&self, route: DispatchRoute, timer: Arc<Timer>) {
            self.routes.lock().unwrap().push(route);
            timer.invoke();
        }
    }

    #[test]
    fn test_insert_sorted_orders_by_next_signal() {
        let t1 = Timer::new(0.0, false, false, || {});
        let t2 = Timer::new(0.0, false, false, || {});
        let t3 = Timer::new(0.0, false, false, || {});
        t1.set_next_signal(30.0);
        t2.set_next_signal(10.0);
        t3.set_next_signal(20.0);

        let mut queue = Vec::new();
        assert!(insert_sorted(&mut queue, &t1));
        assert!(insert_sorted(&mut queue, &t2));
        assert!(!insert_sorted(&mut queue, &t3));

        let deadlines: Vec<f64> = queue
            .iter()
            .filter_map(|slot| slot.upgrade())
            .map(|t| t.next_signal())
            .collect();
        assert_eq!(deadlines, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_insert_sorted_ties_keep_insertion_order() {
        let first = Timer::new(0.0, false, false, || {});
        let second = Timer::new(0.0, false, false, || {});
        first.set_next_signal(10.0);
        second.set_next_signal(10.0);

        let mut queue = Vec::new();
        insert_sorted(&mut queue, &first);
        assert!(!insert_sorted(&mut queue, &second));

        let head = queue[0].upgrade().unwrap();
        assert!(Arc::ptr_eq(&head, &first));
    }

    #[test]
    fn test_insert_sorted_skips_expired_entries() {
        let mut queue = Vec::new();
        {
            let short_lived = Timer::new(0.0, false, false, || {});
            short_lived.set_next_signal(1.0);
            insert_sorted(&mut queue, &short_lived);
        }
        assert_eq!(queue.len(), 1);

        // the expired entry must not mask the new head
        let live = Timer::new(0.0, false, false, || {});
        live.set_next_signal(50.0);
        assert!(insert_sorted(&mut queue, &live));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drain_dispatches_due_and_keeps_future() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let due = Timer::new(0.0, false, false, move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let future = Timer::new(60.0, false, false, || {});
        due.set_next_signal(epoch_seconds_now() - 0.1);

        let mut queue = Vec::new();
        insert_sorted(&mut queue, &due);
        insert_sorted(&mut queue, &future);

        drain_due(&mut queue, &InlineDispatcher);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
        let remaining = queue[0].upgrade().unwrap();
        assert!(Arc::ptr_eq(&remaining, &future));
    }

    #[test]
    fn test_drain_rearms_recurring_from_previous_deadline() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        // requested interval is below the floor
        let timer = Timer::new(0.001, true, false, move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let first_deadline = epoch_seconds_now() - 0.005;
        timer.set_next_signal(first_deadline);

        let mut queue = Vec::new();
        insert_sorted(&mut queue, &timer);

        drain_due(&mut queue, &InlineDispatcher);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
        let rearmed = first_deadline + MIN_TIMER_INTERVAL_SECS;
        assert!((timer.next_signal() - rearmed).abs() < 1e-9);
    }

    #[test]
    fn test_drain_routes_by_invoke_on_main() {
        let recorder = RecordingDispatcher {
            routes: StdMutex::new(Vec::new()),
        };
        let main_timer = Timer::new(0.0, false, true, || {});
        let worker_timer = Timer::new(0.0, false, false, || {});
        main_timer.set_next_signal(epoch_seconds_now() - 1.0);
        worker_timer.set_next_signal(epoch_seconds_now() - 0.5);

        let mut queue = Vec::new();
        insert_sorted(&mut queue, &main_timer);
        insert_sorted(&mut queue, &worker_timer);

        drain_due(&mut queue, &recorder);

        let routes = recorder.routes.lock().unwrap();
        assert_eq!(
            routes.as_slice(),
            &[DispatchRoute::Main, DispatchRoute::Worker]
        );
    }

    #[tokio::test]
    async fn test_second_scheduler_rejected_while_live() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();

        let second = TimerScheduler::new(Arc::new(InlineDispatcher));
        assert!(matches!(second, Err(SchedulerError::AlreadyRunning)));

        scheduler.shutdown().await;

        // the slot frees up once the first scheduler is gone
        let third = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();
        third.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_frees_the_singleton_slot() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();
        drop(scheduler);

        let next = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();
        next.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_shot_fires_exactly_once() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let timer = scheduler
            .start_timer(0.05, false, false, move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.queue_len().await, 0);

        drop(timer);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_before_fire_never_invokes() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let timer = scheduler
            .start_timer(0.3, false, false, move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(scheduler.stop_timer(&timer).await);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_unknown_timer_returns_false() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();

        let never_started = Timer::new(1.0, false, false, || {});
        assert!(!scheduler.stop_timer(&never_started).await);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_owner_cancels_silently() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let timer = scheduler
            .start_timer(0.15, true, false, move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        drop(timer);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.queue_len().await, 0);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_recurring_respects_interval_floor() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let timer = scheduler
            .start_timer(0.001, true, false, move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let fired = count.load(Ordering::SeqCst);

        // 500 ms at one fire per 10 ms floor caps the count near 50;
        // without the floor it would be in the hundreds
        assert!(fired >= 3, "expected repeated fires, got {}", fired);
        assert!(fired <= 55, "floor not applied, got {} fires", fired);

        drop(timer);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_earliest_timer_wakes_early() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();

        let far = scheduler.start_timer(30.0, false, false, || {}).await;

        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let near = scheduler
            .start_timer(0.05, false, false, move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        // without the head-change wake-up the task would sleep toward the
        // 30 second deadline
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(near);
        drop(far);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_all_timers_clears_queue() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        let t1 = scheduler
            .start_timer(0.2, false, false, move || {
                c1.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let t2 = scheduler
            .start_timer(0.25, true, false, move || {
                c2.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        scheduler.stop_all_timers().await;
        assert_eq!(scheduler.queue_len().await, 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        drop(t1);
        drop(t2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_task() {
        let _guard = test_guard();
        let scheduler = TimerScheduler::new(Arc::new(InlineDispatcher)).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let timer = scheduler
            .start_timer(0.05, true, false, move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await;

        let at_shutdown = count.load(Ordering::SeqCst);
        assert!(at_shutdown >= 1);

        // the task is joined, so no further fires can land
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_shutdown);

        drop(timer);
    }
}
