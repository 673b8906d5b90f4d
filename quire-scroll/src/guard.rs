//! Reentrancy guard for scroll propagation.

/// Which surface started the sync in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncSource {
    Editor,
    Preview,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GuardState {
    #[default]
    Idle,
    FromEditor,
    FromPreview,
}

/// Three-state flag: at most one direction syncs at a time.
///
/// A surface event may only start a sync while the guard is idle. The
/// host settles the guard after the tick in which the programmatic scroll
/// was applied, so the resulting scroll event of the other surface is
/// swallowed instead of fed back.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncGuard {
    state: GuardState,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard for `source`. Fails while any sync is in flight.
    pub fn try_begin(&mut self, source: SyncSource) -> bool {
        if self.state != GuardState::Idle {
            return false;
        }
        self.state = match source {
            SyncSource::Editor => GuardState::FromEditor,
            SyncSource::Preview => GuardState::FromPreview,
        };
        true
    }

    /// Claim the guard for `source` even if a sync is in flight. Returns
    /// the state that was replaced.
    pub fn take_over(&mut self, source: SyncSource) -> GuardState {
        let previous = self.state;
        self.state = match source {
            SyncSource::Editor => GuardState::FromEditor,
            SyncSource::Preview => GuardState::FromPreview,
        };
        previous
    }

    pub fn settle(&mut self) {
        self.state = GuardState::Idle;
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == GuardState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_direction_at_a_time() {
        let mut guard = SyncGuard::new();
        assert!(guard.try_begin(SyncSource::Editor));
        assert_eq!(guard.state(), GuardState::FromEditor);

        assert!(!guard.try_begin(SyncSource::Preview));
        assert!(!guard.try_begin(SyncSource::Editor));
        assert_eq!(guard.state(), GuardState::FromEditor);

        guard.settle();
        assert!(guard.is_idle());
        assert!(guard.try_begin(SyncSource::Preview));
        assert_eq!(guard.state(), GuardState::FromPreview);
    }

    #[test]
    fn test_take_over_replaces_sync_in_flight() {
        let mut guard = SyncGuard::new();
        assert!(guard.try_begin(SyncSource::Preview));
        assert_eq!(guard.take_over(SyncSource::Editor), GuardState::FromPreview);
        assert_eq!(guard.state(), GuardState::FromEditor);

        guard.settle();
        assert_eq!(guard.take_over(SyncSource::Editor), GuardState::Idle);
    }
}
