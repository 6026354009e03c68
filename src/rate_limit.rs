use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};

/// Process-wide throttle flag raised when the gateway reports rate limiting.
///
/// Stored as a single until-timestamp (unix millis) behind compare-and-set so
/// concurrent stage executions cannot shorten an already-active window.
#[derive(Debug, Default)]
pub struct RateLimitState {
    until_ms: AtomicI64,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the flag is active right now.
    pub fn is_active(&self) -> bool {
        self.until_ms.load(Ordering::Acquire) > Utc::now().timestamp_millis()
    }

    /// When the current window ends, if one is active.
    pub fn active_until(&self) -> Option<DateTime<Utc>> {
        let until = self.until_ms.load(Ordering::Acquire);
        if until > Utc::now().timestamp_millis() {
            DateTime::from_timestamp_millis(until)
        } else {
            None
        }
    }

    /// Raise the flag for `seconds` from now. Only ever extends the window.
    pub fn activate_for(&self, seconds: u64) {
        let target = (Utc::now() + Duration::seconds(seconds as i64)).timestamp_millis();
        let mut current = self.until_ms.load(Ordering::Acquire);
        while target > current {
            match self.until_ms.compare_exchange(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn clear(&self) {
        self.until_ms.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_inactive() {
        let state = RateLimitState::new();
        assert!(!state.is_active());
        assert!(state.active_until().is_none());
    }

    #[test]
    fn activates_and_clears() {
        let state = RateLimitState::new();
        state.activate_for(60);
        assert!(state.is_active());
        assert!(state.active_until().is_some());
        state.clear();
        assert!(!state.is_active());
    }

    #[test]
    fn shorter_window_does_not_shrink_active_one() {
        let state = RateLimitState::new();
        state.activate_for(600);
        let until = state.active_until().unwrap();
        state.activate_for(1);
        assert!(state.active_until().unwrap() >= until);
    }
}
