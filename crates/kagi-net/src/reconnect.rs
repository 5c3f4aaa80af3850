//! Reconnection state and exponential backoff.
//!
//! One state record per peer: whether a reconnection loop is running and
//! how many attempts it has made. The backoff is `min(base·2^(n-1), cap)`:
//! 100 ms doubling to a 30 s ceiling by default. A wake-from-sleep reset
//! zeroes every reconnecting peer's attempt count so in-flight cycles
//! restart at the minimum delay.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// First retry delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Delay ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// `min(base·2^(n-1), cap)` for attempt `n` (1-based).
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(63);
    cap.min(base.saturating_mul(factor.min(u32::MAX as u64) as u32))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconnectionState {
    pub is_reconnecting: bool,
    pub attempt_count: u32,
}

pub struct ReconnectionManager {
    states: Mutex<HashMap<crate::transport::PeerId, ReconnectionState>>,
    base: Duration,
    cap: Duration,
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_CAP)
    }
}

impl ReconnectionManager {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            base,
            cap,
        }
    }

    pub fn state(&self, peer: &crate::transport::PeerId) -> ReconnectionState {
        self.states.lock().get(peer).copied().unwrap_or_default()
    }

    pub fn is_reconnecting(&self, peer: &crate::transport::PeerId) -> bool {
        self.state(peer).is_reconnecting
    }

    /// Returns false if the peer was already reconnecting (no second loop
    /// may start).
    pub fn try_start_reconnecting(&self, peer: &crate::transport::PeerId) -> bool {
        let mut states = self.states.lock();
        let state = states.entry(peer.clone()).or_default();
        if state.is_reconnecting {
            return false;
        }
        state.is_reconnecting = true;
        true
    }

    pub fn stop_reconnecting(&self, peer: &crate::transport::PeerId) {
        if let Some(state) = self.states.lock().get_mut(peer) {
            state.is_reconnecting = false;
        }
    }

    /// Re-assert mid-flush failure without spawning a second loop.
    pub fn reassert_reconnecting(&self, peer: &crate::transport::PeerId) {
        self.states
            .lock()
            .entry(peer.clone())
            .or_default()
            .is_reconnecting = true;
    }

    pub fn increment_attempt(&self, peer: &crate::transport::PeerId) -> u32 {
        let mut states = self.states.lock();
        let state = states.entry(peer.clone()).or_default();
        state.attempt_count += 1;
        state.attempt_count
    }

    pub fn reset_backoff(&self, peer: &crate::transport::PeerId) {
        if let Some(state) = self.states.lock().get_mut(peer) {
            state.attempt_count = 0;
        }
    }

    /// Delay before the *next* attempt.
    pub fn calculate_backoff(&self, peer: &crate::transport::PeerId) -> Duration {
        backoff_delay(self.base, self.cap, self.state(peer).attempt_count + 1)
    }

    /// `max == 0` means retry forever.
    pub fn should_retry(&self, peer: &crate::transport::PeerId, max_attempts: u32) -> bool {
        max_attempts == 0 || self.state(peer).attempt_count < max_attempts
    }

    /// Wake-from-sleep: every reconnecting peer starts over at the minimum
    /// delay.
    pub fn reset_all_backoffs(&self) {
        let mut states = self.states.lock();
        for (peer, state) in states.iter_mut() {
            if state.is_reconnecting && state.attempt_count > 0 {
                debug!(%peer, "backoff reset by wake detector");
                state.attempt_count = 0;
            }
        }
    }

    pub fn forget(&self, peer: &crate::transport::PeerId) {
        self.states.lock().remove(peer);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerId;

    #[test]
    fn test_backoff_law() {
        // with base=100ms, cap=30s the i-th delay is min(100·2^(i-1), 30000)
        for (attempt, expected_ms) in [
            (1u32, 100u64),
            (2, 200),
            (3, 400),
            (4, 800),
            (5, 1600),
            (6, 3200),
            (7, 6400),
            (8, 12800),
            (9, 25600),
            (10, 30000),
            (15, 30000),
            (20, 30000),
        ] {
            assert_eq!(
                backoff_delay(BACKOFF_BASE, BACKOFF_CAP, attempt),
                Duration::from_millis(expected_ms),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn test_backoff_huge_attempt_saturates_at_cap() {
        assert_eq!(backoff_delay(BACKOFF_BASE, BACKOFF_CAP, 64), BACKOFF_CAP);
        assert_eq!(backoff_delay(BACKOFF_BASE, BACKOFF_CAP, u32::MAX), BACKOFF_CAP);
    }

    #[test]
    fn test_single_reconnection_loop() {
        let manager = ReconnectionManager::default();
        let peer = PeerId::new("p1");
        assert!(manager.try_start_reconnecting(&peer));
        // a second dialer must not start
        assert!(!manager.try_start_reconnecting(&peer));
        manager.stop_reconnecting(&peer);
        assert!(manager.try_start_reconnecting(&peer));
    }

    #[test]
    fn test_attempt_counting_and_reset() {
        let manager = ReconnectionManager::default();
        let peer = PeerId::new("p1");
        manager.try_start_reconnecting(&peer);
        assert_eq!(manager.increment_attempt(&peer), 1);
        assert_eq!(manager.increment_attempt(&peer), 2);
        assert_eq!(manager.calculate_backoff(&peer), Duration::from_millis(400));
        manager.reset_backoff(&peer);
        assert_eq!(manager.state(&peer).attempt_count, 0);
        assert_eq!(manager.calculate_backoff(&peer), Duration::from_millis(100));
    }

    #[test]
    fn test_should_retry_zero_means_infinite() {
        let manager = ReconnectionManager::default();
        let peer = PeerId::new("p1");
        for _ in 0..1000 {
            manager.increment_attempt(&peer);
        }
        assert!(manager.should_retry(&peer, 0));
        assert!(!manager.should_retry(&peer, 10));
        assert!(manager.should_retry(&peer, 2000));
    }

    #[test]
    fn test_reset_all_backoffs_only_touches_reconnecting_peers() {
        let manager = ReconnectionManager::default();
        let down = PeerId::new("down");
        let up = PeerId::new("up");
        manager.try_start_reconnecting(&down);
        manager.increment_attempt(&down);
        manager.increment_attempt(&up); // not reconnecting
        manager.reset_all_backoffs();
        assert_eq!(manager.state(&down).attempt_count, 0);
        assert_eq!(manager.state(&up).attempt_count, 1);
    }
}
