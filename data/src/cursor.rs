use exchange::{ResolutionClass, Timeframe};
use serde::{Deserialize, Serialize};

/// Retry distances, in bars, for one resolution class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepPolicy {
    /// Step back after an empty page, multiplied by the running failure count
    pub empty_step: u64,
    /// Step back past the known span after an overlapping page
    pub ordering_step: u64,
    /// How far behind the oldest known bar a gap retry re-requests from
    pub gap_step: u64,
    /// Largest hole tolerated from a cursor behind the closest retry position.
    /// Stays below `empty_step`, so stepping back never hides bars the venue holds.
    pub max_gap_bars: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StepPolicies {
    pub fine: StepPolicy,
    pub medium: StepPolicy,
    pub coarse: StepPolicy,
}

impl StepPolicies {
    pub fn for_class(&self, class: ResolutionClass) -> StepPolicy {
        match class {
            ResolutionClass::Fine => self.fine,
            ResolutionClass::Medium => self.medium,
            ResolutionClass::Coarse => self.coarse,
        }
    }

    pub fn for_timeframe(&self, timeframe: Timeframe) -> StepPolicy {
        self.for_class(timeframe.class())
    }
}

impl Default for StepPolicies {
    fn default() -> Self {
        Self {
            fine: StepPolicy {
                empty_step: 1_440,
                ordering_step: 2_880,
                gap_step: 0,
                max_gap_bars: 60,
            },
            medium: StepPolicy {
                empty_step: 500,
                ordering_step: 1_000,
                gap_step: 0,
                max_gap_bars: 24,
            },
            coarse: StepPolicy {
                empty_step: 100,
                ordering_step: 200,
                gap_step: 0,
                max_gap_bars: 6,
            },
        }
    }
}

/// Time boundary for the next "before" page request.
///
/// Unset until the initial load lands. Every move is a whole number of
/// intervals and never wraps below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAxisCursor {
    position: Option<u64>,
    interval: Timeframe,
}

impl TimeAxisCursor {
    pub fn new(interval: Timeframe) -> Self {
        Self {
            position: None,
            interval,
        }
    }

    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn is_initialized(&self) -> bool {
        self.position.is_some()
    }

    pub fn initialize(&mut self, oldest_loaded: u64) {
        self.position = Some(oldest_loaded);
    }

    pub fn advance(&mut self, new_oldest: u64) {
        self.position = Some(new_oldest);
    }

    pub fn step_back(&mut self, multiplier: u64) -> Option<u64> {
        let distance = self.interval.to_seconds().saturating_mul(multiplier);
        let moved = self.position?.saturating_sub(distance);
        self.position = Some(moved);
        Some(moved)
    }

    /// Moves the cursor forward to `multiplier` intervals behind `boundary`.
    ///
    /// A cursor already at or past that target stays where it is.
    pub fn step_closer(&mut self, boundary: u64, multiplier: u64) -> Option<u64> {
        let distance = self.interval.to_seconds().saturating_mul(multiplier);
        let target = boundary.saturating_sub(distance);
        let moved = self.position?.max(target);
        self.position = Some(moved);
        Some(moved)
    }
}
