use crate::{
    backfill::FailureCounter, config::EngineConfig, cursor::TimeAxisCursor,
    live::LiveMergeAdapter, placeholder::PlaceholderBuffer, series::SeriesStore,
    viewport::LogicalRange,
};

use exchange::{Ticker, Timeframe};
use uuid::Uuid;

use std::fmt;

/// Identity of one symbol/interval view. A fresh id is minted on every switch,
/// so responses issued under an older session can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub ticker: Ticker,
    pub timeframe: Timeframe,
}

impl Session {
    pub fn new(ticker: Ticker, timeframe: Timeframe) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker,
            timeframe,
        }
    }

    pub fn is_same_view(&self, ticker: &Ticker, timeframe: Timeframe) -> bool {
        self.ticker == *ticker && self.timeframe == timeframe
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ticker, self.timeframe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    /// Waiting for the newest page
    Loading,
    Ready,
}

/// All mutable state scoped to one session. Dropped wholesale on switch.
#[derive(Debug)]
pub struct SessionContext {
    pub session: Session,
    pub store: SeriesStore,
    pub cursor: TimeAxisCursor,
    pub failures: FailureCounter,
    pub placeholders: PlaceholderBuffer,
    pub live: LiveMergeAdapter,
    /// Last visible range sampled by the scheduler
    pub last_range: Option<LogicalRange>,
    phase: LoadPhase,
}

impl SessionContext {
    pub fn new(session: Session, config: &EngineConfig) -> Self {
        let timeframe = session.timeframe;
        Self {
            session,
            store: SeriesStore::new(timeframe),
            cursor: TimeAxisCursor::new(timeframe),
            failures: FailureCounter::new(config.failure_threshold, config.soft_misses_per_failure),
            placeholders: PlaceholderBuffer::new(config.left_buffer_bars, config.max_placeholders),
            live: LiveMergeAdapter::new(),
            last_range: None,
            phase: LoadPhase::Loading,
        }
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == LoadPhase::Ready
    }

    /// Seeds the series with the newest page.
    ///
    /// The cursor starts at the oldest bar loaded and the left buffer is filled.
    /// Returns false when the page held no bars, leaving the session loading.
    pub fn complete_initial_load(&mut self, bars: &[exchange::Bar]) -> bool {
        if bars.is_empty() {
            return false;
        }
        self.store.merge(bars);
        self.placeholders.reconcile(&mut self.store);

        let Some(oldest) = self.store.oldest_bar_time() else {
            return false;
        };

        self.cursor.initialize(oldest);
        self.phase = LoadPhase::Ready;
        log::info!(
            "[{}] initial load: {} bars, oldest {}",
            self.session,
            self.store.bar_count(),
            oldest
        );
        true
    }

    /// Keeps the sampled range in step with a programmatic viewport shift.
    pub fn record_shift(&mut self, range: LogicalRange) {
        self.last_range = Some(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exchange::Bar;

    fn context(left_buffer_bars: usize) -> SessionContext {
        let config = EngineConfig {
            left_buffer_bars,
            ..Default::default()
        };
        let session = Session::new(Ticker::new("BTCUSDT").unwrap(), Timeframe::M15);
        SessionContext::new(session, &config)
    }

    #[test]
    fn every_session_gets_a_fresh_id() {
        let ticker = Ticker::new("BTC/USDT").unwrap();
        let a = Session::new(ticker.clone(), Timeframe::M15);
        let b = Session::new(ticker.clone(), Timeframe::M15);

        assert_ne!(a.id, b.id);
        assert!(a.is_same_view(&ticker, Timeframe::M15));
        assert!(!a.is_same_view(&ticker, Timeframe::H1));
        assert_eq!(a.to_string(), "BTC/USDT@15m");
    }

    #[test]
    fn initial_load_seeds_cursor_and_buffer() {
        let mut ctx = context(20);
        let bars: Vec<Bar> = (10..15)
            .map(|i| Bar::new(i * 900, 1.0, 1.0, 1.0, 1.0, 1.0))
            .collect();

        assert!(ctx.complete_initial_load(&bars));

        assert!(ctx.is_ready());
        assert_eq!(ctx.cursor.position(), Some(9_000));
        // only 10 intervals fit between epoch and the first bar
        assert_eq!(ctx.store.placeholder_count(), 10);
    }

    #[test]
    fn empty_initial_page_keeps_loading() {
        let mut ctx = context(20);

        assert!(!ctx.complete_initial_load(&[]));
        assert_eq!(ctx.phase(), LoadPhase::Loading);
        assert!(!ctx.cursor.is_initialized());
    }
}
