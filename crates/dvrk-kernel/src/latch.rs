//! [`EventLatch`] – single-slot, clearable, awaitable signal.
//!
//! A latch holds the last value delivered to it plus a `signaled` flag.  The
//! flag is `true` iff a [`set`][EventLatch::set] happened since the last
//! [`clear`][EventLatch::clear].  The command side uses the
//! clear → publish → wait pattern:
//!
//! ```
//! use std::time::Duration;
//! use dvrk_kernel::EventLatch;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let latch = EventLatch::new(false);
//! latch.clear();
//! // ... publish a command; the delivery side eventually calls:
//! latch.set(true);
//! assert!(latch.wait_signaled(Duration::from_secs(1)).await);
//! assert!(latch.latest());
//! # }
//! ```
//!
//! # Concurrency
//!
//! `set` may run on a delivery task concurrently with `wait_signaled` on the
//! command task.  The waiter registers for notification *before* inspecting
//! the flag, so a `set` landing between `clear` and the start of the wait is
//! never missed, and a `set` from before `clear` never satisfies it.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct Slot<T> {
    value: T,
    signaled: bool,
}

/// Last-known value plus a binary signal.
pub struct EventLatch<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

impl<T: Clone> EventLatch<T> {
    /// Create an unsignaled latch holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: initial,
                signaled: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Re-arm the latch.  The stored value is kept, but callers must not rely
    /// on it until the next delivery.
    pub fn clear(&self) {
        self.lock().signaled = false;
    }

    /// Store `value`, mark the latch signaled and wake every current waiter.
    ///
    /// This is the only mutation path used by inbound delivery.
    pub fn set(&self, value: T) {
        {
            let mut slot = self.lock();
            slot.value = value;
            slot.signaled = true;
        }
        self.notify.notify_waiters();
    }

    /// Wait until the latch is signaled or `timeout` elapses.
    ///
    /// Returns whether the latch was signaled.  Waiting does not consume the
    /// signal; only [`clear`][Self::clear] does.  A timeout too large to add
    /// to the current instant waits without a deadline.
    pub async fn wait_signaled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent `set` cannot
            // slip between the check and the await.
            notified.as_mut().enable();

            if self.lock().signaled {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.lock().signaled;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// The most recently stored value, without blocking.
    pub fn latest(&self) -> T {
        self.lock().value.clone()
    }

    /// Whether a delivery happened since the last `clear`.
    pub fn is_signaled(&self) -> bool {
        self.lock().signaled
    }

    /// Read the stored value and whether the latch was signaled, and clear
    /// the signal, under one lock.  A `set` racing with this call either
    /// shows up in the returned pair or leaves the latch signaled.
    pub fn take_signal(&self) -> (T, bool) {
        let mut slot = self.lock();
        let signaled = std::mem::replace(&mut slot.signaled, false);
        (slot.value.clone(), signaled)
    }

    /// The stored value if the latch is signaled.
    pub fn signaled_value(&self) -> Option<T> {
        let slot = self.lock();
        slot.signaled.then(|| slot.value.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Default> Default for EventLatch<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn clear_set_wait_observes_value() {
        let latch = EventLatch::new(String::new());
        latch.clear();
        latch.set("DVRK_READY".to_string());
        assert!(latch.wait_signaled(Duration::from_secs(60)).await);
        assert_eq!(latch.latest(), "DVRK_READY");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_set_from_another_task_unblocks_waiter() {
        let latch = Arc::new(EventLatch::new(0_u32));
        latch.clear();

        let writer = Arc::clone(&latch);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            writer.set(7);
        });

        let start = Instant::now();
        assert!(latch.wait_signaled(Duration::from_secs(60)).await);
        assert_eq!(latch.latest(), 7);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn set_before_clear_does_not_satisfy_wait() {
        let latch = EventLatch::new(false);
        latch.set(true);
        latch.clear();

        assert!(!latch.wait_signaled(Duration::from_secs(1)).await);
        assert!(!latch.is_signaled());
        assert_eq!(latch.signaled_value(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_without_set_times_out_after_full_duration() {
        let latch: EventLatch<bool> = EventLatch::default();
        let timeout = Duration::from_secs(60);

        let start = Instant::now();
        assert!(!latch.wait_signaled(timeout).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "returned early after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_returns_when_already_signaled() {
        let latch = EventLatch::new(0);
        latch.set(1);
        assert!(latch.wait_signaled(Duration::MAX).await);
        assert_eq!(latch.latest(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_waits_for_a_later_set() {
        let latch = Arc::new(EventLatch::new(0));
        let writer = Arc::clone(&latch);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            writer.set(9);
        });
        assert!(latch.wait_signaled(Duration::MAX).await);
        assert_eq!(latch.latest(), 9);
    }

    #[test]
    fn take_signal_reports_and_clears() {
        let latch = EventLatch::new("Home".to_string());
        assert_eq!(latch.take_signal(), ("Home".to_string(), false));

        latch.set("DVRK_READY".to_string());
        assert_eq!(latch.take_signal(), ("DVRK_READY".to_string(), true));
        assert!(!latch.is_signaled());
        assert_eq!(latch.latest(), "DVRK_READY");
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_does_not_consume_the_signal() {
        let latch = EventLatch::new(1);
        latch.set(2);
        assert!(latch.wait_signaled(Duration::from_secs(1)).await);
        assert!(latch.wait_signaled(Duration::from_secs(1)).await);
        assert_eq!(latch.signaled_value(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn one_set_wakes_every_waiter() {
        let latch = Arc::new(EventLatch::new(0));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let l = Arc::clone(&latch);
            waiters.push(tokio::spawn(async move {
                l.wait_signaled(Duration::from_secs(10)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        latch.set(42);

        for w in waiters {
            assert!(w.await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn latest_keeps_last_of_several_deliveries() {
        let latch = EventLatch::new(0);
        latch.clear();
        for v in 1..=5 {
            latch.set(v);
        }
        assert!(latch.wait_signaled(Duration::ZERO).await);
        assert_eq!(latch.latest(), 5);
    }

    #[test]
    fn latest_never_blocks() {
        let latch = EventLatch::new(vec![0.1, 0.2]);
        assert_eq!(latch.latest(), vec![0.1, 0.2]);
        assert!(!latch.is_signaled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clear_set_wait_holds_under_parallel_workers() {
        let latch = Arc::new(EventLatch::new(0_u32));
        for round in 1..=500 {
            latch.clear();
            let writer = Arc::clone(&latch);
            let setter = tokio::spawn(async move {
                if round % 2 == 0 {
                    tokio::task::yield_now().await;
                }
                writer.set(round);
            });
            assert!(
                latch.wait_signaled(Duration::from_secs(5)).await,
                "round {round} missed its wakeup"
            );
            assert_eq!(latch.latest(), round);
            setter.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn take_signal_never_loses_a_racing_set() {
        for round in 0..200_u32 {
            let latch = Arc::new(EventLatch::new(0_u32));
            let writer = Arc::clone(&latch);
            let setter = tokio::spawn(async move { writer.set(round + 1) });

            let (value, signaled) = latch.take_signal();
            setter.await.unwrap();
            // Either the set was observed here or it is still pending.
            assert!((signaled && value == round + 1) || latch.is_signaled());
        }
    }

    #[test]
    fn set_and_clear_work_across_threads() {
        let latch = Arc::new(EventLatch::new(0_u64));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let l = Arc::clone(&latch);
                std::thread::spawn(move || l.set(i))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(latch.is_signaled());
        assert!(latch.latest() < 4);
    }
}
