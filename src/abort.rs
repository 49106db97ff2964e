//! Cooperative cancellation tokens.
//!
//! Blocking instrument calls cannot be interrupted from outside, so every
//! long-running activity polls an [`AbortFlag`] instead. One flag belongs to
//! one activity (sweep, oscilloscope monitor, calibration record). Waits go
//! through [`AbortFlag::sleep`], which wakes at least every poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on the time between two abort checks inside a wait.
pub const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared, polled cancellation token with an optional reason.
///
/// Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag {
    flag: Arc<AtomicBool>,
    reason: Arc<parking_lot::RwLock<Option<String>>>,
}

impl AbortFlag {
    /// Create a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first reason given is kept.
    ///
    /// Returns `true` if this call tripped the flag.
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        let mut current = self.reason.write();
        if current.is_none() {
            *current = Some(reason.into());
        }
        !self.flag.swap(true, Ordering::SeqCst)
    }

    /// Check whether cancellation was requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason passed to the first [`trigger`](Self::trigger).
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Clear the flag and its reason.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        *self.reason.write() = None;
    }

    /// Sleep for `duration`, returning early once the flag is triggered.
    ///
    /// Returns `true` if the full duration elapsed, `false` if aborted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.sleep_polling(duration, ABORT_POLL_INTERVAL).await
    }

    /// Like [`sleep`](Self::sleep) with an explicit poll interval.
    pub async fn sleep_polling(&self, duration: Duration, poll: Duration) -> bool {
        let poll = poll.min(ABORT_POLL_INTERVAL).max(Duration::from_millis(1));
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep((deadline - now).min(poll)).await;
        }
    }
}

/// Slot holding the flag of whichever sweep is currently running.
///
/// Lets other activities (the safety monitor, an operator) abort "the
/// running sweep" without owning its worker. Empty while idle.
#[derive(Debug, Clone, Default)]
pub struct ActiveAbort {
    slot: Arc<parking_lot::RwLock<Option<AbortFlag>>>,
}

impl ActiveAbort {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `flag` as the running activity's flag.
    pub fn register(&self, flag: &AbortFlag) {
        *self.slot.write() = Some(flag.clone());
    }

    /// Empty the slot.
    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    /// Whether an activity is registered.
    pub fn is_active(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Trigger the registered flag. Returns `true` only if a registered
    /// flag was tripped by this call; an empty slot or an activity already
    /// aborting gives `false`.
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        self.slot
            .read()
            .as_ref()
            .is_some_and(|flag| flag.trigger(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_and_reset() {
        let flag = AbortFlag::new();
        assert!(!flag.is_triggered());

        assert!(flag.trigger("range limit"));
        assert!(!flag.trigger("second reason"));
        assert!(flag.is_triggered());
        assert_eq!(flag.reason(), Some("range limit".to_string()));

        flag.reset();
        assert!(!flag.is_triggered());
        assert_eq!(flag.reason(), None);
    }

    #[tokio::test]
    async fn test_sleep_completes_when_not_triggered() {
        let flag = AbortFlag::new();
        assert!(flag.sleep(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_trigger() {
        let flag = AbortFlag::new();
        let remote = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.trigger("stop");
        });

        let started = std::time::Instant::now();
        let completed = flag.sleep(Duration::from_secs(5)).await;
        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_active_slot_is_noop_when_idle() {
        let active = ActiveAbort::new();
        assert!(!active.trigger("nothing running"));

        let flag = AbortFlag::new();
        active.register(&flag);
        assert!(active.is_active());
        assert!(active.trigger("operator"));
        assert!(!active.trigger("again"));
        assert_eq!(flag.reason(), Some("operator".to_string()));

        active.clear();
        assert!(!active.is_active());
    }
}
