//! Common test utilities shared across integration tests.

use std::time::Duration;

/// Wait for a condition to become true, polling every few milliseconds.
///
/// This is more reliable than fixed sleeps since scheduling latency can
/// vary.
///
/// # Panics
///
/// Panics if the timeout is reached before the condition holds.
pub fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("timed out after {:?} waiting for condition", timeout);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
