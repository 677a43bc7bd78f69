//! Anti-stampede gate: bounds how many AIs may actually post a reply to
//! one message, checked just before broadcast.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Entries older than this are dropped by `cleanup`.
const ENTRY_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Default)]
pub struct ReplyController {
    counts: Mutex<HashMap<String, (usize, Instant)>>,
}

impl ReplyController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a reply slot for `message_id`. Returns false once
    /// `max_concurrent_replies` slots are taken.
    pub fn try_claim(&self, message_id: &str, max_concurrent_replies: usize) -> bool {
        let mut counts = self.counts.lock().unwrap();
        let entry = counts
            .entry(message_id.to_string())
            .or_insert((0, Instant::now()));
        if entry.0 >= max_concurrent_replies {
            debug!(message_id, taken = entry.0, "reply slot denied");
            return false;
        }
        entry.0 += 1;
        true
    }

    /// Drop tracking entries older than an hour.
    pub fn cleanup(&self) {
        let mut counts = self.counts.lock().unwrap();
        counts.retain(|_, (_, at)| at.elapsed() < ENTRY_MAX_AGE);
    }

    pub fn tracked(&self) -> usize {
        self.counts.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_bounded_per_message() {
        let controller = ReplyController::new();
        assert!(controller.try_claim("m1", 2));
        assert!(controller.try_claim("m1", 2));
        assert!(!controller.try_claim("m1", 2));
        // Other messages are unaffected.
        assert!(controller.try_claim("m2", 2));
    }

    #[test]
    fn cleanup_keeps_fresh_entries() {
        let controller = ReplyController::new();
        controller.try_claim("m1", 3);
        controller.cleanup();
        assert_eq!(controller.tracked(), 1);
    }
}
