//! Torrent-level lifecycle state machine.

use std::fmt;

use super::TorrentError;

/// Where a torrent is between add and drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    AwaitingMetadata,
    Idle,
    Buffering,
    Playing,
    Seeding,
    Paused,
    /// Terminal.
    Removed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::AwaitingMetadata => "awaiting metadata",
            LifecycleState::Idle => "idle",
            LifecycleState::Buffering => "buffering",
            LifecycleState::Playing => "playing",
            LifecycleState::Seeding => "seeding",
            LifecycleState::Paused => "paused",
            LifecycleState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Current state plus the state `resume` returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lifecycle {
    state: LifecycleState,
    before_pause: Option<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == LifecycleState::Paused
    }

    /// State that is in effect ignoring a pause.
    pub fn effective(&self) -> LifecycleState {
        self.before_pause.unwrap_or(self.state)
    }

    /// Moves to `next`.
    ///
    /// While paused the move is recorded as the state to resume into.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - `next` is not reachable from the current state
    pub fn transition(&mut self, next: LifecycleState) -> Result<(), TorrentError> {
        if next == LifecycleState::Removed {
            self.state = LifecycleState::Removed;
            self.before_pause = None;
            return Ok(());
        }
        if next == LifecycleState::Paused {
            return self.pause();
        }
        let current = self.effective();
        if current == next {
            return Ok(());
        }
        if !allowed(current, next) {
            return Err(TorrentError::InvalidState {
                reason: format!("cannot move from {current} to {next}"),
            });
        }
        if self.is_paused() {
            self.before_pause = Some(next);
        } else {
            self.state = next;
        }
        Ok(())
    }

    /// Idempotent.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - torrent was removed
    pub fn pause(&mut self) -> Result<(), TorrentError> {
        match self.state {
            LifecycleState::Removed => Err(TorrentError::InvalidState {
                reason: "cannot pause a removed torrent".to_string(),
            }),
            LifecycleState::Paused => Ok(()),
            current => {
                self.before_pause = Some(current);
                self.state = LifecycleState::Paused;
                Ok(())
            }
        }
    }

    /// Returns to the state saved by `pause`. Idempotent.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - torrent was removed
    pub fn resume(&mut self) -> Result<(), TorrentError> {
        match self.state {
            LifecycleState::Removed => Err(TorrentError::InvalidState {
                reason: "cannot resume a removed torrent".to_string(),
            }),
            LifecycleState::Paused => {
                self.state = self.before_pause.take().unwrap_or(LifecycleState::Idle);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn allowed(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
        (from, to),
        (AwaitingMetadata, Idle)
            | (Idle, Buffering | Playing | Seeding)
            | (Buffering, Playing | Idle)
            | (Playing, Idle | Buffering | Seeding)
            | (Seeding, Idle | Buffering | Playing)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lifecycle = Lifecycle::new();
        for next in [
            LifecycleState::Idle,
            LifecycleState::Buffering,
            LifecycleState::Playing,
            LifecycleState::Idle,
            LifecycleState::Seeding,
            LifecycleState::Removed,
        ] {
            lifecycle.transition(next).unwrap();
            assert_eq!(lifecycle.state(), next);
        }
    }

    #[test]
    fn test_buffering_needs_metadata() {
        let mut lifecycle = Lifecycle::new();
        assert!(matches!(
            lifecycle.transition(LifecycleState::Buffering),
            Err(TorrentError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_pause_saves_previous_state() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(LifecycleState::Idle).unwrap();
        lifecycle.transition(LifecycleState::Buffering).unwrap();

        lifecycle.pause().unwrap();
        lifecycle.pause().unwrap();
        assert!(lifecycle.is_paused());
        assert_eq!(lifecycle.effective(), LifecycleState::Buffering);

        // Buffering finishes while paused.
        lifecycle.transition(LifecycleState::Playing).unwrap();
        assert!(lifecycle.is_paused());

        lifecycle.resume().unwrap();
        lifecycle.resume().unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Playing);
    }

    #[test]
    fn test_removed_is_terminal() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(LifecycleState::Removed).unwrap();
        assert!(lifecycle.transition(LifecycleState::Idle).is_err());
        assert!(lifecycle.pause().is_err());
        assert!(lifecycle.resume().is_err());
    }
}
