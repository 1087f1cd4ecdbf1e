//! Typing indicators with a self-healing TTL

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Someone is typing to us
#[derive(Debug, Clone, PartialEq)]
pub struct TypingIndicator {
    pub user_id: i64,
    pub display_name: String,
    pub expires_at: Instant,
}

/// Indicators expire on their own; a "stopped" signal only clears early
#[derive(Debug)]
pub struct TypingTracker {
    ttl: Duration,
    indicators: HashMap<i64, TypingIndicator>,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            indicators: HashMap::new(),
        }
    }

    /// Apply a signal. Returns whether the visible state changed.
    pub fn signal(&mut self, user_id: i64, display_name: Option<&str>, is_typing: bool, now: Instant) -> bool {
        if !is_typing {
            return self.stop(user_id);
        }

        let expires_at = now + self.ttl;
        match self.indicators.get_mut(&user_id) {
            Some(indicator) => {
                indicator.expires_at = expires_at;
                if let Some(name) = display_name {
                    indicator.display_name = name.to_string();
                }
                false
            }
            None => {
                self.indicators.insert(
                    user_id,
                    TypingIndicator {
                        user_id,
                        display_name: display_name.unwrap_or_default().to_string(),
                        expires_at,
                    },
                );
                true
            }
        }
    }

    /// Clear one indicator early
    pub fn stop(&mut self, user_id: i64) -> bool {
        self.indicators.remove(&user_id).is_some()
    }

    /// Drop indicators whose TTL has run out. Returns their user ids.
    pub fn expire(&mut self, now: Instant) -> Vec<i64> {
        let expired: Vec<i64> = self
            .indicators
            .values()
            .filter(|i| now >= i.expires_at)
            .map(|i| i.user_id)
            .collect();
        for user_id in &expired {
            self.indicators.remove(user_id);
        }
        expired
    }

    pub fn is_typing(&self, user_id: i64, now: Instant) -> bool {
        self.indicators
            .get(&user_id)
            .is_some_and(|i| now < i.expires_at)
    }

    pub fn get(&self, user_id: i64) -> Option<&TypingIndicator> {
        self.indicators.get(&user_id)
    }

    /// Earliest pending expiry, for the driver's timer
    pub fn next_expiry(&self) -> Option<Instant> {
        self.indicators.values().map(|i| i.expires_at).min()
    }

    pub fn clear(&mut self) {
        self.indicators.clear();
    }
}
