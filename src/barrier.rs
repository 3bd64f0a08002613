//! Counted completion barrier for fan-out operations.
//!
//! Unsubscribe and close fan out across brokers and must proceed once every
//! broker has answered or a deadline has passed, whichever comes first. The
//! callback fires at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

type BarrierCallback = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct CountedBarrier {
    inner: Arc<BarrierInner>,
}

struct BarrierInner {
    remaining: Mutex<usize>,
    fired: AtomicBool,
    callback: Mutex<Option<BarrierCallback>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl CountedBarrier {
    /// Build a barrier over `count` completions. A zero count fires the
    /// callback immediately; a timeout fires it when the deadline passes
    /// with completions still outstanding.
    pub fn new(
        count: usize,
        timeout: Option<Duration>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Self {
        let barrier = Self {
            inner: Arc::new(BarrierInner {
                remaining: Mutex::new(count),
                fired: AtomicBool::new(false),
                callback: Mutex::new(Some(Box::new(callback))),
                timer: Mutex::new(None),
            }),
        };

        if count == 0 {
            barrier.fire();
            return barrier;
        }

        if let Some(timeout) = timeout {
            let timed = barrier.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timed.fire();
            });
            *barrier.inner.timer.lock().unwrap() = Some(handle);
        }

        barrier
    }

    /// Record one completion, firing the callback on the last one
    pub fn completed_one(&self) {
        let done = {
            let mut remaining = self.inner.remaining.lock().unwrap();
            *remaining = remaining.saturating_sub(1);
            *remaining == 0
        };
        if done {
            self.fire();
        }
    }

    /// Whether the callback has run
    pub fn fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    fn fire(&self) {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.inner.timer.lock().unwrap().take() {
            timer.abort();
        }
        let callback = self.inner.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for CountedBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountedBarrier")
            .field("remaining", &*self.inner.remaining.lock().unwrap())
            .field("fired", &self.fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = count.clone();
        (count, move || {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_fires_on_count_reached() {
        let (fired, callback) = counter();
        let barrier = CountedBarrier::new(2, None, callback);

        barrier.completed_one();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        barrier.completed_one();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_count_fires_immediately() {
        let (fired, callback) = counter();
        let _barrier = CountedBarrier::new(0, None, callback);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extra_completions_do_not_refire() {
        let (fired, callback) = counter();
        let barrier = CountedBarrier::new(1, None, callback);
        barrier.completed_one();
        barrier.completed_one();
        barrier.completed_one();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_fires_when_completions_outstanding() {
        let (fired, callback) = counter();
        let barrier = CountedBarrier::new(3, Some(Duration::from_millis(20)), callback);
        barrier.completed_one();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Late completions after the timeout stay silent
        barrier.completed_one();
        barrier.completed_one();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_cancels_timer() {
        let (fired, callback) = counter();
        let barrier = CountedBarrier::new(1, Some(Duration::from_millis(20)), callback);
        barrier.completed_one();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
