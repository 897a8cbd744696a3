//! Wait strategies for polled transports.
//!
//! Sockets are woken by the OS through tokio's reactor. The shared memory ring
//! has no wakeup primitive, so a task waiting on it re-polls the cursors on a
//! schedule chosen by a [`WaitStrategy`]. Whatever the strategy, the global
//! timeout is applied outside of it and behaves identically.

use crate::config::IpcConfig;
use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::time::Duration;
use tokio::time::Sleep;

/// How a task waiting on a ring buffer spends its time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Yield to the scheduler on every poll. Lowest latency, burns a core.
    Yield,
    /// Yield for the first `spins` polls, then sleep `interval` between polls.
    SpinThenSleep { spins: u32, interval: Duration },
    /// Always sleep `interval` between polls.
    Sleep(Duration),
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::SpinThenSleep {
            spins: IpcConfig::RING_SPIN_POLLS,
            interval: IpcConfig::RING_SLEEP_INTERVAL,
        }
    }
}

impl WaitStrategy {
    /// Wait before re-checking a condition for the `attempt`-th time.
    pub async fn pause(&self, attempt: u32) {
        match self.interval_for(attempt) {
            None => tokio::task::yield_now().await,
            Some(interval) => tokio::time::sleep(interval).await,
        }
    }

    /// Sleep interval for a given attempt, or `None` to just yield.
    fn interval_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            WaitStrategy::Yield => None,
            WaitStrategy::SpinThenSleep { spins, interval } => {
                if attempt < spins {
                    None
                } else {
                    Some(interval)
                }
            }
            WaitStrategy::Sleep(interval) => Some(interval),
        }
    }
}

/// Poll-side state of a [`WaitStrategy`] for use inside `poll_*` methods.
#[derive(Debug)]
pub(crate) struct Backoff {
    strategy: WaitStrategy,
    attempt: u32,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Backoff {
    pub(crate) fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            attempt: 0,
            sleep: None,
        }
    }

    /// Forget earlier attempts after the condition made progress.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
        self.sleep = None;
    }

    /// Arrange for the task to be polled again later. The caller returns
    /// `Poll::Pending` afterwards.
    pub(crate) fn schedule_retry(&mut self, cx: &mut Context<'_>) {
        match self.strategy.interval_for(self.attempt) {
            None => {
                self.attempt = self.attempt.saturating_add(1);
                cx.waker().wake_by_ref();
            }
            Some(interval) => {
                let sleep = self
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(interval)));
                if sleep.as_mut().poll(cx).is_ready() {
                    self.sleep = None;
                    self.attempt = self.attempt.saturating_add(1);
                    cx.waker().wake_by_ref();
                }
            }
        }
    }
}

/// Poll `check` until it returns `true`, pausing according to `strategy`.
pub async fn poll_until<F>(strategy: WaitStrategy, mut check: F)
where
    F: FnMut() -> bool,
{
    let mut attempt = 0u32;
    while !check() {
        strategy.pause(attempt).await;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::task::Poll;

    #[test]
    fn test_spin_then_sleep_intervals() {
        let strategy = WaitStrategy::SpinThenSleep {
            spins: 2,
            interval: Duration::from_millis(1),
        };
        assert_eq!(strategy.interval_for(0), None);
        assert_eq!(strategy.interval_for(1), None);
        assert_eq!(strategy.interval_for(2), Some(Duration::from_millis(1)));
        assert_eq!(WaitStrategy::Yield.interval_for(1000), None);
    }

    #[tokio::test]
    async fn test_poll_until_sees_condition() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        poll_until(WaitStrategy::Sleep(Duration::from_millis(1)), move || {
            c.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_backoff_counts_spins() {
        let mut backoff = Backoff::new(WaitStrategy::Yield);
        let mut fut = futures::future::poll_fn(|cx| {
            backoff.schedule_retry(cx);
            Poll::Ready(backoff.attempt)
        });
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(1));
    }
}
