//! Self-rescheduling timer.
//!
//! A [`FlexTimer`] repeatedly invokes its callback and schedules the next
//! invocation at the absolute timestamp the callback returns. Callbacks can
//! vary their own rate (back off when idle, tighten after activity) without
//! the timer knowing the policy.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::callback::{FlexCallback, NextFire, TimerCallback};
use crate::event_loop::{LoopHandle, TimerHandle};

struct TimerState {
    running: bool,
    /// At most one outstanding scheduled dispatch; exclusively owned and
    /// cancelled before being dropped or replaced.
    pending: Option<TimerHandle>,
}

struct Shared {
    loop_handle: LoopHandle,
    /// Locked only for the duration of an invocation, so a callback calling
    /// `stop` on its own timer touches the state lock, not this one.
    callback: Mutex<TimerCallback>,
    state: Mutex<TimerState>,
}

/// A timer that reschedules itself from its callback's return value.
///
/// Created through [`LoopHandle::register_timer`]. Clones share the same
/// underlying timer, so a callback can capture a clone and stop its own
/// timer. The timer persists across start/stop cycles.
///
/// A callback that panics disables the timer: the failure surfaces through
/// the runtime's task failure channel, nothing is rescheduled, and the timer
/// is left running with no pending work until `stop` or a later restart.
#[derive(Clone)]
pub struct FlexTimer {
    shared: Arc<Shared>,
}

impl FlexTimer {
    pub(crate) fn new<F>(loop_handle: LoopHandle, callback: F) -> Self
    where
        F: FnMut(Instant) -> NextFire + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                loop_handle,
                callback: Mutex::new(Box::new(callback)),
                state: Mutex::new(TimerState {
                    running: false,
                    pending: None,
                }),
            }),
        }
    }

    /// Start the timer, firing first after `delay`. No-op if already running.
    pub fn start(&self, delay: Duration) {
        let mut state = self.shared.state();
        if state.running {
            return;
        }
        state.running = true;
        let fire_at = self.shared.loop_handle.now() + delay;
        // Stored under the lock so a zero-delay firing cannot observe a
        // half-started timer.
        state.pending = Some(self.shared.schedule_dispatch(fire_at));
        tracing::debug!(?delay, "flex timer started");
    }

    /// Stop the timer and cancel any pending firing. No-op if already
    /// stopped.
    ///
    /// A stop that races with a firing is safe: the invocation task checks
    /// state before touching the callback. Stopping while the callback is
    /// suspended mid-invocation cannot abort the in-flight callback but does
    /// prevent the next reschedule.
    pub fn stop(&self) {
        let mut state = self.shared.state();
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
        tracing::debug!("flex timer stopped");
    }

    /// Whether the timer is logically active.
    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }
}

impl Shared {
    /// Lock the state, recovering from poisoning so a panicked callback
    /// leaves the timer controllable.
    fn state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callback(&self) -> MutexGuard<'_, TimerCallback> {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule the dispatch stage at `fire_at` with the event loop.
    fn schedule_dispatch(self: &Arc<Self>, fire_at: Instant) -> TimerHandle {
        let shared = Arc::clone(self);
        self.loop_handle
            .call_at(fire_at, FlexCallback::sync(move || shared.dispatch()))
    }

    /// Fire stage: the scheduled handle is now spent. The callback is not
    /// invoked here on the timer-firing stack; it is funneled through a
    /// fresh task so a `stop` racing with the firing is observed by the
    /// state check at task entry.
    fn dispatch(self: Arc<Self>) {
        self.state().pending = None;
        let handle = self.loop_handle.clone();
        handle.spawn(self.run_callback());
    }

    /// Invocation task. The state check here is the authoritative
    /// cancellation gate; cancelling the handle alone is racy once it has
    /// fired.
    async fn run_callback(self: Arc<Self>) {
        if !self.state().running {
            return;
        }
        let fired_at = self.loop_handle.now();
        let next = {
            let mut callback = self.callback();
            (*callback)(fired_at)
        };
        let next_at = match next {
            NextFire::At(at) => at,
            NextFire::Pending(future) => future.await,
        };
        let mut state = self.state();
        if state.running {
            // A callback that stopped and restarted this timer left a live
            // handle behind; cancel it before storing the replacement.
            if let Some(stale) = state.pending.take() {
                stale.cancel();
            }
            state.pending = Some(self.schedule_dispatch(next_at));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting_timer(
        handle: &LoopHandle,
        period: Duration,
    ) -> (FlexTimer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let timer = handle.register_timer(move |now| {
            counter.fetch_add(1, Ordering::SeqCst);
            NextFire::At(now + period)
        });
        (timer, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_marks_timer_running_before_delay_elapses() {
        let handle = LoopHandle::current();
        let (timer, count) = counting_timer(&handle, Duration::from_secs(1));

        assert!(!timer.is_running());
        timer.start(Duration::from_secs(30));
        assert!(timer.is_running());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_repeatedly_with_returned_gap() {
        let handle = LoopHandle::current();
        let fires: Arc<std::sync::Mutex<Vec<Instant>>> = Arc::default();

        let recorder = Arc::clone(&fires);
        let timer = handle.register_timer(move |now| {
            recorder.lock().unwrap().push(now);
            NextFire::At(now + Duration::from_secs(1))
        });

        timer.start(Duration::ZERO);
        sleep(Duration::from_millis(3500)).await;
        timer.stop();

        let fires = fires.lock().unwrap();
        assert!(
            (3..=4).contains(&fires.len()),
            "expected 3 or 4 fires, got {}",
            fires.len()
        );
        for pair in fires.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let handle = LoopHandle::current();
        let (timer, count) = counting_timer(&handle, Duration::from_secs(1));

        timer.start(Duration::ZERO);
        timer.start(Duration::ZERO);

        sleep(Duration::from_millis(3500)).await;
        timer.stop();

        // A second schedule would have roughly doubled the count.
        let fired = count.load(Ordering::SeqCst);
        assert!((3..=4).contains(&fired), "expected 3 or 4 fires, got {fired}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let handle = LoopHandle::current();
        let (timer, count) = counting_timer(&handle, Duration::from_secs(1));

        timer.start(Duration::from_secs(5));
        timer.stop();
        timer.stop();

        assert!(!timer.is_running());
        sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_fire_suppresses_callback() {
        let handle = LoopHandle::current();
        let (timer, count) = counting_timer(&handle, Duration::from_secs(1));

        timer.start(Duration::from_secs(5));
        sleep(Duration::from_secs(1)).await;
        timer.stop();

        sleep(Duration::from_secs(9)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_between_fire_and_invocation_suppresses_callback() {
        let handle = LoopHandle::current();
        let (timer, count) = counting_timer(&handle, Duration::from_secs(1));

        timer.start(Duration::ZERO);
        // One yield lets the due dispatch run and queue the invocation task;
        // stop then lands before the invocation polls its state check.
        tokio::task::yield_now().await;
        timer.stop();

        sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspending_callback_reschedules_relative_to_completion() {
        let handle = LoopHandle::current();
        let fires: Arc<std::sync::Mutex<Vec<Instant>>> = Arc::default();

        let recorder = Arc::clone(&fires);
        let timer = handle.register_timer(move |now| {
            recorder.lock().unwrap().push(now);
            NextFire::pending(async move {
                sleep(Duration::from_secs(2)).await;
                Instant::now() + Duration::from_secs(3)
            })
        });

        timer.start(Duration::ZERO);
        // First fire at 0, suspension until 2, next fire at 5.
        sleep(Duration::from_millis(5500)).await;
        timer.stop();

        let fires = fires.lock().unwrap();
        assert_eq!(fires.len(), 2);
        assert!(fires[1] - fires[0] >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_suspension_prevents_reschedule() {
        let handle = LoopHandle::current();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let timer = handle.register_timer(move |now| {
            counter.fetch_add(1, Ordering::SeqCst);
            NextFire::pending(async move {
                sleep(Duration::from_secs(2)).await;
                now + Duration::from_secs(3)
            })
        });

        timer.start(Duration::ZERO);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The in-flight callback cannot be aborted, but its reschedule must
        // not happen.
        timer.stop();
        sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_restarts_after_stop() {
        let handle = LoopHandle::current();
        let (timer, count) = counting_timer(&handle, Duration::from_secs(1));

        timer.start(Duration::ZERO);
        sleep(Duration::from_millis(1500)).await;
        timer.stop();
        let after_first_cycle = count.load(Ordering::SeqCst);
        assert!(after_first_cycle >= 1);

        timer.start(Duration::ZERO);
        sleep(Duration::from_millis(1500)).await;
        timer.stop();
        assert!(count.load(Ordering::SeqCst) > after_first_cycle);
    }
}
