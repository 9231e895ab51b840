//! Parallel lifecycle of a meta-iterator.

use crate::error::SchedError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommState {
    #[default]
    Uninitialized,
    CommsInitialized,
    CommsSet,
    Running,
    CommsFreed,
}

impl CommState {
    pub fn name(self) -> &'static str {
        match self {
            CommState::Uninitialized => "uninitialized",
            CommState::CommsInitialized => "communicators initialized",
            CommState::CommsSet => "communicators set",
            CommState::Running => "running",
            CommState::CommsFreed => "communicators freed",
        }
    }

    pub fn can_move_to(self, to: CommState) -> bool {
        use CommState::*;
        matches!(
            (self, to),
            (Uninitialized, CommsInitialized)
                | (CommsInitialized, CommsSet)
                | (CommsSet, Running)
                | (Running, Running)
                | (CommsSet, CommsFreed)
                | (Running, CommsFreed)
        )
    }

    /// Fail unless `to` is reachable from the current state.
    pub fn check(self, to: CommState) -> Result<(), SchedError> {
        if self.can_move_to(to) {
            Ok(())
        } else {
            Err(SchedError::Lifecycle { from: self.name(), to: to.name() })
        }
    }

    pub fn advance(&mut self, to: CommState) -> Result<(), SchedError> {
        self.check(to)?;
        *self = to;
        Ok(())
    }

    pub fn abort(&mut self) {
        *self = CommState::CommsFreed;
    }
}

impl fmt::Display for CommState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_path_and_repeated_runs() {
        let mut state = CommState::default();
        for to in [CommState::CommsInitialized, CommState::CommsSet, CommState::Running, CommState::Running, CommState::CommsFreed] {
            state.advance(to).unwrap();
        }
        assert_eq!(state, CommState::CommsFreed);
    }

    #[test]
    fn out_of_order_transitions_fail() {
        let mut state = CommState::Uninitialized;
        assert!(matches!(state.advance(CommState::Running), Err(SchedError::Lifecycle { .. })));
        state.advance(CommState::CommsInitialized).unwrap();
        assert!(state.check(CommState::CommsFreed).is_err());
        state.abort();
        assert_eq!(state, CommState::CommsFreed);
        assert!(state.check(CommState::Running).is_err());
    }
}
