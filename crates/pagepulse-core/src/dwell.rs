//! Visible-time accounting per page.
//!
//! [`DwellTimer`] is a two-state machine (`Idle`, `Accumulating`). Only time
//! spent `Accumulating` counts, so switching tabs away and back neither
//! double-counts nor loses the interval that is open when a measurement is
//! taken. A separate anchor marks when the current page began, for the
//! wall-clock `total_ms`.
//!
//! All timestamps are ms since the Unix epoch. If the clock moves backwards
//! an interval counts as 0.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwellState {
    Idle,
    Accumulating { since: u64 },
}

#[derive(Debug, Clone)]
pub struct DwellTimer {
    state: DwellState,
    accumulated_ms: u64,
    page_started_at: u64,
}

impl DwellTimer {
    /// New timer for a page that began at `now`, initially idle.
    #[must_use]
    pub fn new(now: u64) -> Self {
        Self {
            state: DwellState::Idle,
            accumulated_ms: 0,
            page_started_at: now,
        }
    }

    /// Idle -> Accumulating. No-op when already accumulating.
    pub fn on_visible(&mut self, now: u64) {
        if self.state == DwellState::Idle {
            self.state = DwellState::Accumulating { since: now };
        }
    }

    /// Accumulating -> Idle, folding the open interval. No-op when idle.
    pub fn on_hidden(&mut self, now: u64) {
        if let DwellState::Accumulating { since } = self.state {
            self.accumulated_ms += now.saturating_sub(since);
            self.state = DwellState::Idle;
        }
    }

    /// Return visible time so far and start counting from zero.
    ///
    /// An open interval is folded in first and then reopened at `now`, the
    /// same as `on_hidden(now)` followed by `on_visible(now)`.
    pub fn snapshot_and_reset(&mut self, now: u64) -> u64 {
        let was_accumulating = self.is_accumulating();
        self.on_hidden(now);
        let visible = std::mem::take(&mut self.accumulated_ms);
        if was_accumulating {
            self.on_visible(now);
        }
        visible
    }

    /// Wall-clock ms since the current page began; moves the anchor to `now`.
    pub fn begin_page(&mut self, now: u64) -> u64 {
        let total = now.saturating_sub(self.page_started_at);
        self.page_started_at = now;
        total
    }

    #[must_use]
    pub fn state(&self) -> DwellState {
        self.state
    }

    #[must_use]
    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, DwellState::Accumulating { .. })
    }

    /// Folded visible time, excluding any open interval.
    #[must_use]
    pub fn accumulated_ms(&self) -> u64 {
        self.accumulated_ms
    }

    #[must_use]
    pub fn page_started_at(&self) -> u64 {
        self.page_started_at
    }
}
