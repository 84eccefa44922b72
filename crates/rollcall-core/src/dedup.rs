//! Per-session deduplication of recognized identities.

use crate::types::EnrollmentId;
use std::collections::HashSet;

/// Set of identities already recorded in one capture session.
///
/// Lives exactly as long as the session that owns it; a new session starts
/// from an empty tracker, so the same identity can be recorded again.
#[derive(Debug, Default)]
pub struct SessionTracker {
    seen: HashSet<EnrollmentId>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only the first time `id` is offered.
    pub fn try_record(&mut self, id: EnrollmentId) -> bool {
        self.seen.insert(id)
    }

    pub fn contains(&self, id: EnrollmentId) -> bool {
        self.seen.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_offer_wins() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.try_record(7));
        assert!(!tracker.try_record(7));
        assert!(!tracker.try_record(7));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_distinct_ids_all_recorded() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.try_record(1));
        assert!(tracker.try_record(2));
        assert!(tracker.try_record(3));
        assert!(!tracker.try_record(2));
        assert_eq!(tracker.len(), 3);
        assert!(tracker.contains(3));
        assert!(!tracker.contains(4));
    }

    #[test]
    fn test_fresh_tracker_has_no_memory() {
        let mut first = SessionTracker::new();
        assert!(first.try_record(7));

        let mut second = SessionTracker::new();
        assert!(second.is_empty());
        assert!(second.try_record(7));
    }
}
