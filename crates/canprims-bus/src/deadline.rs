use std::time::{Duration, Instant};

/// The point at which a bounded wait gives up.
///
/// A timeout too large to add to the monotonic clock never expires, so any
/// `Duration` is a valid timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Time left before expiry, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        let Some(at) = self.0 else {
            return Some(Duration::MAX);
        };
        let left = at.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    pub fn is_unbounded(&self) -> bool {
        self.0.is_none()
    }
}
