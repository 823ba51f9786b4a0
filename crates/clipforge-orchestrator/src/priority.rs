//! Priority assignment for bulk imports.

use clipforge_core::PrioritySettings;
use clipforge_core::job::{MAX_PRIORITY, MIN_PRIORITY};

/// Picks the priority of the i-th item of a bulk import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityStrategy {
    /// Start at `start`, drop one tier every `step_every` items, never below `floor`.
    Decay {
        /// Priority of the first item
        start: u8,
        /// Items per tier
        step_every: usize,
        /// Lowest priority handed out
        floor: u8,
    },
    /// Same priority for every item.
    Fixed(u8),
}

impl Default for PriorityStrategy {
    fn default() -> Self {
        Self::Decay { start: MAX_PRIORITY, step_every: 10, floor: MIN_PRIORITY }
    }
}

impl PriorityStrategy {
    /// Priority for the item at `index` (0-based).
    pub fn priority_for(&self, index: usize) -> u8 {
        match *self {
            Self::Decay { start, step_every, floor } => {
                let drop = index / step_every.max(1);
                let priority = usize::from(start).saturating_sub(drop).max(usize::from(floor));
                u8::try_from(priority).unwrap_or(floor)
            }
            Self::Fixed(priority) => priority,
        }
    }
}

impl From<&PrioritySettings> for PriorityStrategy {
    fn from(settings: &PrioritySettings) -> Self {
        match *settings {
            PrioritySettings::Decay { start, step_every, floor } => {
                Self::Decay { start, step_every, floor }
            }
            PrioritySettings::Fixed { priority } => Self::Fixed(priority),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_decay() {
        let strategy = PriorityStrategy::default();
        assert_eq!(strategy.priority_for(0), 5);
        assert_eq!(strategy.priority_for(9), 5);
        assert_eq!(strategy.priority_for(10), 4);
        assert_eq!(strategy.priority_for(25), 3);
        assert_eq!(strategy.priority_for(40), 1);
        assert_eq!(strategy.priority_for(1000), 1);
    }

    #[test]
    fn test_custom_decay_and_fixed() {
        let strategy = PriorityStrategy::Decay { start: 4, step_every: 2, floor: 2 };
        let priorities: Vec<u8> = (0..8).map(|i| strategy.priority_for(i)).collect();
        assert_eq!(priorities, vec![4, 4, 3, 3, 2, 2, 2, 2]);
        assert_eq!(PriorityStrategy::Fixed(3).priority_for(99), 3);
    }

    #[test]
    fn test_from_settings() {
        let settings = PrioritySettings::Fixed { priority: 2 };
        assert_eq!(PriorityStrategy::from(&settings), PriorityStrategy::Fixed(2));
        assert_eq!(PriorityStrategy::from(&PrioritySettings::default()), PriorityStrategy::default());
    }
}
