//! Resettable flush deadline on tokio's clock.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// A deadline that every new change pushes back.
///
/// Runs on `tokio::time`, so tests drive it with a paused clock.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// (Re)start the quiet period from now.
    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    /// Arm for a specific wait, e.g. a retry backoff.
    pub fn reset_after(&mut self, wait: Duration) {
        self.deadline = Some(Instant::now() + wait);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves when the current deadline passes; never if disarmed.
    ///
    /// The future owns a copy of the deadline, so the timer can be reset while
    /// a previous wait is still being polled.
    pub fn expired(&self) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        }
    }
}
