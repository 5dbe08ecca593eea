//! Error types for event loop operations.

use thiserror::Error;

/// Errors that can occur when interacting with the event loop.
///
/// Failures raised by user callbacks are not represented here; they surface
/// through the runtime's task failure channel.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Runtime construction failed.
    #[error("failed to build event loop runtime: {0}")]
    Init(#[source] std::io::Error),

    /// The dedicated worker thread for a blocking call could not be spawned.
    #[error("failed to spawn blocking worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// The blocking worker exited without delivering a result.
    #[error("blocking worker exited without delivering a result")]
    WorkerLost,

    /// Signal handler registration failed.
    #[error("failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),
}
