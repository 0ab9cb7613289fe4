//! Progress the consumer reports back to the server.

use serde::Serialize;

use crate::lsn::Lsn;

/// Applied and flushed positions reported to the server.
///
/// Both positions only move forward; a lower value is ignored rather than
/// reported, since going backwards is a protocol violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackState {
    pub applied: Lsn,
    pub flushed: Lsn,
}

impl FeedbackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance `applied`. Returns true if the position moved.
    pub fn advance_applied(&mut self, lsn: Lsn) -> bool {
        if lsn > self.applied {
            self.applied = lsn;
            true
        } else {
            false
        }
    }

    /// Advance `flushed`. Returns true if the position moved.
    pub fn advance_flushed(&mut self, lsn: Lsn) -> bool {
        if lsn > self.flushed {
            self.flushed = lsn;
            true
        } else {
            false
        }
    }

    /// Advance both positions.
    pub fn advance(&mut self, lsn: Lsn) -> bool {
        let applied = self.advance_applied(lsn);
        let flushed = self.advance_flushed(lsn);
        applied || flushed
    }

    /// True if no position has been reported yet.
    pub fn is_empty(&self) -> bool {
        !self.applied.is_valid() && !self.flushed.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_moves_forward() {
        let mut state = FeedbackState::new();
        assert!(state.is_empty());

        assert!(state.advance(Lsn::new(100)));
        assert_eq!(state.applied, Lsn::new(100));
        assert_eq!(state.flushed, Lsn::new(100));
        assert!(!state.is_empty());
    }

    #[test]
    fn test_never_moves_backwards() {
        let mut state = FeedbackState::new();
        state.advance(Lsn::new(200));

        assert!(!state.advance(Lsn::new(150)));
        assert!(!state.advance(Lsn::new(200)));
        assert_eq!(state.applied, Lsn::new(200));
        assert_eq!(state.flushed, Lsn::new(200));
    }

    #[test]
    fn test_non_decreasing_for_any_order() {
        let orders: [&[u64]; 4] = [
            &[1, 2, 3, 4],
            &[4, 3, 2, 1],
            &[2, 9, 3, 9, 1, 10],
            &[5, 5, 5],
        ];

        for order in orders {
            let mut state = FeedbackState::new();
            let mut previous = state;
            for &value in order {
                state.advance(Lsn::new(value));
                assert!(state.applied >= previous.applied);
                assert!(state.flushed >= previous.flushed);
                previous = state;
            }
            assert_eq!(state.applied.value(), *order.iter().max().unwrap());
        }
    }

    #[test]
    fn test_applied_and_flushed_independent() {
        let mut state = FeedbackState::new();
        state.advance_applied(Lsn::new(50));
        assert_eq!(state.flushed, Lsn::INVALID);

        state.advance_flushed(Lsn::new(40));
        assert_eq!(state.applied, Lsn::new(50));
        assert_eq!(state.flushed, Lsn::new(40));
    }
}
