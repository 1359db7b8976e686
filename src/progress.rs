//! Progress derived from per-item notifications.

/// Items processed so far and the engine's latest estimate of the total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub current: u64,
    pub total: Option<u64>,
}

impl ProgressState {
    /// `current / total`, or `None` while the total is unknown or zero.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.current as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.fraction().is_none()
    }
}

/// Turns a stream of "one more item done" notifications into a monotonic
/// progress value. Owned by the interactive thread.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    state: ProgressState,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one processed item. `total` replaces the known total when it is
    /// larger, since the engine may find more items while scanning.
    ///
    /// Unlike a bar that simply takes the latest total as its maximum, a
    /// smaller value is ignored here, so the total never shrinks and the
    /// fraction never jumps backwards when a later report undercounts.
    pub fn on_item(&mut self, total: u64) {
        self.state.current = self.state.current.saturating_add(1);
        self.state.total = Some(match self.state.total {
            Some(known) => known.max(total),
            None => total,
        });
    }

    /// Back to `(0, unknown)`; called once per job before any item arrives.
    pub fn reset(&mut self) {
        self.state = ProgressState::default();
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn fraction(&self) -> Option<f64> {
        self.state.fraction()
    }
}
