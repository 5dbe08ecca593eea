//! Event loop facade over the tokio runtime.
//!
//! [`EventLoop`] owns a current-thread runtime and its run/stop/close
//! lifecycle. [`LoopHandle`] is the cloneable scheduling surface handed to
//! callbacks and timers: immediate dispatch, delayed dispatch with
//! cancellable handles, timer registration, and blocking offload. All
//! callbacks run on the thread inside [`EventLoop::start`], interleaving
//! only at suspension points.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[cfg(unix)]
use tokio::signal::unix::SignalKind;

use crate::callback::{FlexCallback, NextFire};
use crate::error::LoopError;
use crate::timer::FlexTimer;

/// Cancellable handle for a scheduled callback.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Cancel the scheduled callback. Idempotent.
    ///
    /// Cancellation is best-effort: a callback whose handle has already
    /// fired may still run.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Owner of the event loop runtime.
///
/// Construct one explicitly and pass [`LoopHandle`] clones down the call
/// graph; there is no process-wide default loop.
pub struct EventLoop {
    runtime: Runtime,
    handle: LoopHandle,
}

impl EventLoop {
    /// Build a new event loop on a dedicated current-thread runtime.
    pub fn new() -> Result<Self, LoopError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(LoopError::Init)?;
        let handle = LoopHandle {
            runtime: runtime.handle().clone(),
            shutdown: Arc::new(Notify::new()),
        };
        Ok(Self { runtime, handle })
    }

    /// Get a cloneable handle for scheduling work on this loop.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run the loop, blocking the calling thread until [`stop`] is invoked
    /// from a scheduled callback or another thread.
    ///
    /// A stop requested before `start` is remembered and makes this return
    /// promptly.
    ///
    /// [`stop`]: EventLoop::stop
    pub fn start(&self) {
        tracing::debug!("event loop running");
        let shutdown = Arc::clone(&self.handle.shutdown);
        self.runtime.block_on(async move {
            shutdown.notified().await;
        });
        tracing::debug!("event loop stopped");
    }

    /// Request [`start`] to return.
    ///
    /// [`start`]: EventLoop::start
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Tear down the runtime, cancelling outstanding tasks.
    pub fn close(self) {
        drop(self.runtime);
    }

    /// Current monotonic loop time.
    pub fn now(&self) -> Instant {
        self.handle.now()
    }

    /// See [`LoopHandle::register_callback`].
    pub fn register_callback(&self, callback: FlexCallback) {
        self.handle.register_callback(callback);
    }

    /// See [`LoopHandle::delay_callback`].
    pub fn delay_callback(&self, delay: Duration, callback: FlexCallback) -> TimerHandle {
        self.handle.delay_callback(delay, callback)
    }

    /// See [`LoopHandle::call_at`].
    pub fn call_at(&self, deadline: Instant, callback: FlexCallback) -> TimerHandle {
        self.handle.call_at(deadline, callback)
    }

    /// See [`LoopHandle::register_timer`].
    pub fn register_timer<F>(&self, callback: F) -> FlexTimer
    where
        F: FnMut(Instant) -> NextFire + Send + 'static,
    {
        self.handle.register_timer(callback)
    }

    /// See [`LoopHandle::spawn`].
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// See [`LoopHandle::run_blocking`].
    pub async fn run_blocking<F, T>(&self, callback: F) -> Result<T, LoopError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle.run_blocking(callback).await
    }

    /// See [`LoopHandle::on_signal`].
    #[cfg(unix)]
    pub fn on_signal<F>(&self, kind: SignalKind, callback: F) -> Result<TimerHandle, LoopError>
    where
        F: FnMut() + Send + 'static,
    {
        self.handle.on_signal(kind, callback)
    }
}

/// Cheap handle to an event loop.
///
/// Clones share the loop; the handle is read-only after construction and is
/// safe to move into callbacks, timers, and other threads.
#[derive(Clone)]
pub struct LoopHandle {
    runtime: Handle,
    shutdown: Arc<Notify>,
}

impl LoopHandle {
    /// Bind a handle to the ambient tokio runtime.
    ///
    /// Useful when embedding in an already-running runtime. `stop` on a
    /// handle obtained this way only releases waiters on this handle's own
    /// run gate, not the ambient runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime context.
    pub fn current() -> Self {
        Self {
            runtime: Handle::current(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Current monotonic loop time.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Request the owning [`EventLoop::start`] to return.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Submit a callback for execution at the next scheduling opportunity.
    ///
    /// The callback never runs before this returns. Errors raised during the
    /// later invocation surface through the runtime's task failure channel,
    /// not here.
    pub fn register_callback(&self, callback: FlexCallback) {
        self.runtime.spawn(callback.invoke());
    }

    /// Submit a callback for execution no earlier than `delay` from now.
    ///
    /// Suspending callbacks are constructed only once the delay has elapsed,
    /// so cancelling the returned handle beforehand leaks nothing.
    pub fn delay_callback(&self, delay: Duration, callback: FlexCallback) -> TimerHandle {
        self.call_at(self.now() + delay, callback)
    }

    /// Submit a callback for execution no earlier than the absolute
    /// `deadline`.
    pub fn call_at(&self, deadline: Instant, callback: FlexCallback) -> TimerHandle {
        let task = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            callback.invoke().await;
        });
        TimerHandle::new(task)
    }

    /// Create a [`FlexTimer`] bound to this loop.
    pub fn register_timer<F>(&self, callback: F) -> FlexTimer
    where
        F: FnMut(Instant) -> NextFire + Send + 'static,
    {
        FlexTimer::new(self.clone(), callback)
    }

    /// Spawn a future as a task on the loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Run a blocking callback on a dedicated worker thread, suspending the
    /// caller until it completes.
    ///
    /// A fresh single worker is created and torn down per call rather than
    /// drawn from a pool, which bounds offloaded work to one blocking call
    /// at a time per call site. There is no built-in timeout. A panic in the
    /// callback resumes on the awaiting task.
    pub async fn run_blocking<F, T>(&self, callback: F) -> Result<T, LoopError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("pacer-blocking".into())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(callback));
                let _ = result_tx.send(result);
            })
            .map_err(LoopError::WorkerSpawn)?;

        match result_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(LoopError::WorkerLost),
        }
    }

    /// Invoke `callback` each time `kind` is delivered to the process.
    ///
    /// Cancelling the returned handle removes the registration.
    #[cfg(unix)]
    pub fn on_signal<F>(&self, kind: SignalKind, mut callback: F) -> Result<TimerHandle, LoopError>
    where
        F: FnMut() + Send + 'static,
    {
        let mut stream = {
            let _guard = self.runtime.enter();
            tokio::signal::unix::signal(kind).map_err(LoopError::Signal)?
        };
        let task = self.runtime.spawn(async move {
            while stream.recv().await.is_some() {
                callback();
            }
        });
        Ok(TimerHandle::new(task))
    }
}
