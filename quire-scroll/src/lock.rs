//! Time-boxed pin of the preview to its bottom edge.

use std::time::{Duration, Instant};

/// Deadline-based bottom lock. Engaging again replaces the deadline.
#[derive(Clone, Debug)]
pub struct BottomLock {
    duration: Duration,
    deadline: Option<Instant>,
}

impl BottomLock {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: None,
        }
    }

    pub fn engage(&mut self, now: Instant) {
        self.deadline = Some(now + self.duration);
    }

    pub fn release(&mut self) {
        self.deadline = None;
    }

    /// Whether the lock holds at `now`. Expired deadlines are cleared.
    pub fn is_locked(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now < deadline => true,
            Some(_) => {
                self.deadline = None;
                false
            }
            None => false,
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or_default()
    }
}
