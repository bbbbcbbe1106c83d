//! Exponential backoff for reconnecting loops

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Doubling delay between `base` and `max`
///
/// The Nth consecutive call to `next_delay` returns
/// `min(base * 2^(N-1), max)`; `reset` starts over at `base`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base.min(max),
        }
    }

    /// Return the delay to wait now and double the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Delay the next failure would wait
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base.min(self.max);
    }
}

/// Outcome of one attempt inside `retry_with_backoff`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The attempt succeeded and the loop should run again right away
    Continue,
    /// Stop looping
    Done,
}

/// Run `attempt` until it returns `Flow::Done` or `cancel` fires
///
/// Errors are logged and followed by a backoff sleep; a successful attempt
/// resets the backoff. Cancellation interrupts both the attempt and the
/// sleep.
pub async fn retry_with_backoff<F, Fut, E>(
    what: &str,
    target: &str,
    mut backoff: Backoff,
    cancel: &CancellationToken,
    mut attempt: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Flow, E>>,
    E: Display,
{
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = attempt() => result,
        };

        match result {
            Ok(Flow::Done) => return,
            Ok(Flow::Continue) => backoff.reset(),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "Error doing {} for {}, backing off {:?}: {}",
                    what, target, delay, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
