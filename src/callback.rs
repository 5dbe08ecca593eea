//! Callback representations for the event loop.
//!
//! Callbacks come in two shapes: plain functions that run to completion
//! synchronously, and suspending callbacks that produce a future. The
//! distinction is fixed at the call boundary with a closed enum, so dispatch
//! sites branch on a known variant.

use std::future::Future;
use std::pin::Pin;

use tokio::time::Instant;

/// Boxed future type used across callback boundaries.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A unit of work submitted to the event loop.
///
/// `Suspending` holds a factory rather than a ready-made future: the future
/// is constructed only when the callback actually fires, so cancelling a
/// pending handle never leaves a constructed-but-unpolled future behind.
pub enum FlexCallback {
    /// Runs synchronously when dispatched.
    Sync(Box<dyn FnOnce() + Send>),
    /// Invoked at fire time to produce the future to drive.
    Suspending(Box<dyn FnOnce() -> BoxFuture<()> + Send>),
}

impl FlexCallback {
    /// Wrap a plain function.
    pub fn sync<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::Sync(Box::new(callback))
    }

    /// Wrap a suspending callback.
    ///
    /// `factory` is called when the callback fires, not when it is scheduled.
    pub fn suspending<F, Fut>(factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let thunk: Box<dyn FnOnce() -> BoxFuture<()> + Send> =
            Box::new(move || Box::pin(factory()));
        Self::Suspending(thunk)
    }

    /// Run the callback to completion.
    pub(crate) async fn invoke(self) {
        match self {
            FlexCallback::Sync(callback) => callback(),
            FlexCallback::Suspending(factory) => factory().await,
        }
    }
}

/// Result of one timer callback invocation.
///
/// The timer reschedules itself at the absolute timestamp carried here; a
/// suspending callback returns `Pending` and the timer awaits it before
/// rescheduling.
pub enum NextFire {
    /// Next absolute fire time, produced synchronously.
    At(Instant),
    /// Callback suspended; resolves to the next absolute fire time.
    Pending(BoxFuture<Instant>),
}

impl NextFire {
    /// Wrap a suspending continuation.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Instant> + Send + 'static,
    {
        Self::Pending(Box::pin(future))
    }
}

/// Timer callback: maps the current loop time to the next absolute fire time.
pub type TimerCallback = Box<dyn FnMut(Instant) -> NextFire + Send>;
