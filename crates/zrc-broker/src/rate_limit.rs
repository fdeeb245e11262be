//! Failed-attempt limiting for PIN validation.
//!
//! A session whose PIN has been guessed wrongly too often inside a sliding
//! window is locked out until older failures age out of the window.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::warn;

use crate::model::SessionId;

/// Failure timestamps for a single session.
#[derive(Debug, Default, Clone)]
struct AttemptTracker {
    failures: Vec<DateTime<Utc>>,
}

impl AttemptTracker {
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        self.failures.retain(|at| now - *at < window);
    }
}

/// Sliding-window counter of failed PIN attempts per session.
#[derive(Debug)]
pub struct PinAttemptLimiter {
    max_failures: u32,
    window: Duration,
    trackers: DashMap<SessionId, AttemptTracker>,
}

impl PinAttemptLimiter {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            trackers: DashMap::new(),
        }
    }

    /// True if the session has exhausted its failures inside the window.
    pub fn is_blocked(&self, session_id: &SessionId, now: DateTime<Utc>) -> bool {
        match self.trackers.get_mut(session_id) {
            Some(mut tracker) => {
                tracker.prune(now, self.window);
                tracker.failures.len() as u32 >= self.max_failures
            }
            None => false,
        }
    }

    /// Record a failed attempt. Returns the number of failures in the window.
    pub fn record_failure(&self, session_id: &SessionId, now: DateTime<Utc>) -> u32 {
        let mut tracker = self.trackers.entry(*session_id).or_default();
        tracker.prune(now, self.window);
        tracker.failures.push(now);
        let count = tracker.failures.len() as u32;
        if count >= self.max_failures {
            warn!(
                session_id = %session_id,
                failures = count,
                window_secs = self.window.num_seconds(),
                "PIN attempts exhausted, session locked out"
            );
        }
        count
    }

    /// Forget all failures for a session.
    pub fn reset(&self, session_id: &SessionId) {
        self.trackers.remove(session_id);
    }

    /// Drop trackers whose failures have all aged out.
    pub fn cleanup(&self, now: DateTime<Utc>) {
        self.trackers.retain(|_, tracker| {
            tracker.prune(now, self.window);
            !tracker.failures.is_empty()
        });
    }

    pub fn tracked_sessions(&self) -> usize {
        self.trackers.len()
    }
}
