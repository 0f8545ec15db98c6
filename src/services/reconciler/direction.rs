//! Direction classification from centre movement

use crate::domain::types::Direction;
use crate::infra::config::DirectionPolicy;

/// Classify one step of movement
///
/// Returns `None` when the move stays within the threshold band.
#[inline]
pub fn classify_step(old_centre: f64, new_centre: f64, threshold: f64) -> Option<Direction> {
    let delta = new_centre - old_centre;
    if delta == 0.0 {
        None
    } else if delta >= threshold {
        Some(Direction::Right)
    } else if delta <= -threshold {
        Some(Direction::Left)
    } else {
        None
    }
}

/// Per-direction vote counts, indexed by `Direction`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionTally {
    votes: [u32; 3],
}

impl DirectionTally {
    /// A fresh tally holds the creation frame's STILL vote
    pub fn new() -> Self {
        let mut votes = [0; 3];
        votes[Direction::Still.index()] = 1;
        Self { votes }
    }

    #[inline]
    pub fn vote(&mut self, direction: Direction) {
        let slot = &mut self.votes[direction.index()];
        *slot = slot.saturating_add(1);
    }

    pub fn votes(&self, direction: Direction) -> u32 {
        self.votes[direction.index()]
    }

    /// Direction with the most votes; ties go to the earliest in `Direction::ALL`
    pub fn majority(&self) -> Direction {
        let mut best = Direction::ALL[0];
        for direction in Direction::ALL.into_iter().skip(1) {
            if self.votes(direction) > self.votes(best) {
                best = direction;
            }
        }
        best
    }
}

impl Default for DirectionTally {
    fn default() -> Self {
        Self::new()
    }
}

/// Direction bookkeeping for one track under a fixed policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionState {
    /// Last confident classification
    Current(Direction),
    Tally(DirectionTally),
}

impl DirectionState {
    pub fn new(policy: DirectionPolicy) -> Self {
        match policy {
            DirectionPolicy::SingleShot => DirectionState::Current(Direction::Still),
            DirectionPolicy::MajorityVote => DirectionState::Tally(DirectionTally::new()),
        }
    }

    /// Fold one matched frame's movement into the state
    pub fn update(&mut self, old_centre: f64, new_centre: f64, threshold: f64) {
        let step = classify_step(old_centre, new_centre, threshold);
        match self {
            DirectionState::Current(current) => {
                // Within the jitter band the previous reading is kept
                if let Some(direction) = step {
                    *current = direction;
                }
            }
            DirectionState::Tally(tally) => tally.vote(step.unwrap_or(Direction::Still)),
        }
    }

    /// The direction to report right now
    pub fn resolve(&self) -> Direction {
        match self {
            DirectionState::Current(direction) => *direction,
            DirectionState::Tally(tally) => tally.majority(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_step_threshold_inclusive() {
        assert_eq!(classify_step(100.0, 105.0, 5.0), Some(Direction::Right));
        assert_eq!(classify_step(100.0, 95.0, 5.0), Some(Direction::Left));
        assert_eq!(classify_step(100.0, 104.9, 5.0), None);
        assert_eq!(classify_step(100.0, 95.1, 5.0), None);
    }

    #[test]
    fn test_classify_step_zero_threshold_ignores_no_movement() {
        assert_eq!(classify_step(10.0, 10.0, 0.0), None);
        assert_eq!(classify_step(10.0, 10.5, 0.0), Some(Direction::Right));
    }

    #[test]
    fn test_single_shot_keeps_last_confident_reading() {
        let mut state = DirectionState::new(DirectionPolicy::SingleShot);
        assert_eq!(state.resolve(), Direction::Still);

        state.update(100.0, 110.0, 5.0);
        assert_eq!(state.resolve(), Direction::Right);

        // Jitter does not reset to STILL
        state.update(110.0, 111.0, 5.0);
        assert_eq!(state.resolve(), Direction::Right);

        state.update(111.0, 90.0, 5.0);
        assert_eq!(state.resolve(), Direction::Left);
    }

    #[test]
    fn test_tally_starts_with_still_vote() {
        let tally = DirectionTally::new();
        assert_eq!(tally.votes(Direction::Still), 1);
        assert_eq!(tally.majority(), Direction::Still);
    }

    #[test]
    fn test_majority_vote() {
        let mut state = DirectionState::new(DirectionPolicy::MajorityVote);
        state.update(0.0, 10.0, 5.0); // RIGHT
        state.update(10.0, 20.0, 5.0); // RIGHT
        state.update(20.0, 21.0, 5.0); // STILL
        // STILL 2, RIGHT 2 -> STILL wins the tie
        assert_eq!(state.resolve(), Direction::Still);

        state.update(21.0, 30.0, 5.0);
        assert_eq!(state.resolve(), Direction::Right);
    }

    #[test]
    fn test_majority_tie_priority() {
        let mut tally = DirectionTally { votes: [0, 0, 0] };
        tally.vote(Direction::Right);
        tally.vote(Direction::Left);
        assert_eq!(tally.majority(), Direction::Left);

        tally.vote(Direction::Still);
        assert_eq!(tally.majority(), Direction::Still);
    }
}
