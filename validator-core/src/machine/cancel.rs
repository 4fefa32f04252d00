//! Scoped cancellation for blocking engine calls.
//!
//! The engine polls a condition byte. For the duration of one call, a
//! watcher thread observes the caller's [`Deadline`] and raises that byte.
//! The watcher lives inside a `std::thread::scope`, so it is always joined
//! before the call returns and can never signal a machine that has moved on.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Upper bound on how long a fired deadline goes unnoticed by the watcher.
pub const WATCHER_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A cancellation token with an optional wall-clock limit.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    token: CancellationToken,
    at: Option<Instant>,
}

impl Deadline {
    /// Never fires unless [`cancel`](Self::cancel) is called.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            at: Some(Instant::now() + timeout),
        }
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, at: None }
    }

    /// Combine a token with an optional timeout measured from now.
    pub fn with_timeout(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            at: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || self.at.map_or(false, |at| Instant::now() >= at)
    }
}

#[cfg(test)]
thread_local! {
    static WATCHERS_STARTED: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

/// Watchers started by [`with_interrupt`] on the current thread.
#[cfg(test)]
pub(crate) fn watchers_started() -> u64 {
    WATCHERS_STARTED.with(|count| count.get())
}

/// Run `f` with a condition byte that is raised once `deadline` expires.
///
/// Returns `f`'s result and whether the deadline fired during the call.
pub(crate) fn with_interrupt<R>(deadline: &Deadline, f: impl FnOnce(&AtomicU8) -> R) -> (R, bool) {
    #[cfg(test)]
    WATCHERS_STARTED.with(|count| count.set(count.get() + 1));
    let condition = AtomicU8::new(0);
    let done = AtomicBool::new(false);

    let result = std::thread::scope(|scope| {
        let watcher = scope.spawn(|| {
            while !done.load(Ordering::Acquire) {
                if deadline.is_expired() {
                    condition.store(1, Ordering::Release);
                    break;
                }
                std::thread::park_timeout(WATCHER_POLL_INTERVAL);
            }
        });
        let _release = WatcherRelease {
            done: &done,
            watcher: watcher.thread().clone(),
        };
        f(&condition)
    });

    let fired = condition.load(Ordering::Acquire) != 0 || deadline.is_expired();
    (result, fired)
}

/// Stops the watcher when the call finishes, including by unwinding.
struct WatcherRelease<'a> {
    done: &'a AtomicBool,
    watcher: std::thread::Thread,
}

impl Drop for WatcherRelease<'_> {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
        self.watcher.unpark();
    }
}
