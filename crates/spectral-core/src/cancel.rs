use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Cooperative cancellation shared between a turn and its in-flight work.
/// Sleeps taken through the token wake immediately on `cancel()`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().expect("cancel lock poisoned");
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().expect("cancel lock poisoned")
    }

    /// Wait up to `timeout`. Returns true if the token was cancelled while
    /// (or before) waiting.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().expect("cancel lock poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while !*cancelled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = cvar
                .wait_timeout(cancelled, deadline - now)
                .expect("cancel cvar poisoned");
            cancelled = guard;
            if result.timed_out() && !*cancelled {
                return false;
            }
        }
        true
    }
}

/// Injectable wait used by the dispatcher's backoff so tests can record
/// sleeps instead of actually pausing.
pub trait Sleeper: Send + Sync {
    /// Returns true if cancelled during the wait.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

#[derive(Debug, Default)]
pub struct TokenSleeper;

impl Sleeper for TokenSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        cancel.wait(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wait_expires_without_cancellation() {
        let token = CancelToken::new();
        let started = Instant::now();
        let cancelled = token.wait(Duration::from_millis(20));
        assert!(!cancelled);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_wakes_waiter_immediately() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let cancelled = waiter.wait(Duration::from_secs(30));
            (cancelled, started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(10));
        token.cancel();
        let (cancelled, elapsed) = handle.join().expect("join waiter");
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn pre_cancelled_token_returns_at_once() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.wait(Duration::from_secs(10)));
        assert!(token.is_cancelled());
    }
}
