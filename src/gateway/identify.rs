//! Process-wide identify serialization.
//!
//! The remote platform rate-limits identify handshakes per credential, not
//! per shard, so every shard of one credential acquires the same limiter
//! before sending identify. Resumes never touch it.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::Instant,
};

#[derive(Debug, Default)]
struct Slot {
    not_before: Option<Instant>,
}

/// One-at-a-time identify limiter shared by all shards of a credential.
///
/// Acquisition order is FIFO (tokio's mutex queues waiters fairly), so a
/// shard that has waited longer is never pre-empted by a newer one.
#[derive(Debug)]
pub struct IdentifyLimiter {
    slot: Arc<Mutex<Slot>>,
    reset_after: Duration,
}

impl IdentifyLimiter {
    /// Create a limiter with the remote-declared reset window between
    /// consecutive identifies.
    pub fn new(reset_after: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            reset_after,
        }
    }

    /// Wait for the slot, then for the reset window left by the previous
    /// holder. The returned permit releases on drop, on every exit path.
    pub async fn acquire(&self) -> IdentifyPermit {
        let guard = self.slot.clone().lock_owned().await;

        if let Some(not_before) = guard.not_before {
            let now = Instant::now();
            if not_before > now {
                log::debug!(
                    "Identify slot acquired inside reset window, waiting {:?}",
                    not_before - now
                );
                tokio::time::sleep_until(not_before).await;
            }
        }

        IdentifyPermit {
            guard,
            reset_after: self.reset_after,
        }
    }
}

/// Exclusive right to send one identify frame.
#[derive(Debug)]
pub struct IdentifyPermit {
    guard: OwnedMutexGuard<Slot>,
    reset_after: Duration,
}

impl IdentifyPermit {
    /// Release the slot. Equivalent to dropping the permit, named for call
    /// sites where the hand-back should be visible.
    pub fn release(self) {}
}

impl Drop for IdentifyPermit {
    fn drop(&mut self) {
        self.guard.not_before = Some(Instant::now() + self.reset_after);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_never_two_concurrent_holders() {
        let limiter = Arc::new(IdentifyLimiter::new(Duration::ZERO));
        let holders = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let limiter = limiter.clone();
            let holders = holders.clone();
            tasks.push(tokio::spawn(async move {
                let permit = limiter.acquire().await;

                assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                assert_eq!(holders.fetch_sub(1, Ordering::SeqCst), 1);

                permit.release();
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_arms_reset_window() {
        let reset_after = Duration::from_secs(5);
        let limiter = IdentifyLimiter::new(reset_after);

        limiter.acquire().await.release();

        let before = Instant::now();
        let _permit = limiter.acquire().await;

        assert!(Instant::now() - before >= reset_after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_poison_slot() {
        let limiter = Arc::new(IdentifyLimiter::new(Duration::ZERO));

        let held = limiter.acquire().await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire().await;
            })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        held.release();

        // the slot must still be grantable
        limiter.acquire().await.release();
    }
}
