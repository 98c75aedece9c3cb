use crate::series::SeriesStore;

use exchange::{StreamEvent, Tick, health::ConnectionHealth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMerge {
    /// Forming bar updated in place
    Updated,
    /// New bar started at the tail
    Appended,
    /// Tick older than the newest stored bar
    Ignored,
}

impl LiveMerge {
    pub fn changed(self) -> bool {
        !matches!(self, LiveMerge::Ignored)
    }
}

/// Folds streaming bar updates into the tail of the series.
///
/// Only ever touches the newest bar; history paging state lives elsewhere.
#[derive(Debug, Default)]
pub struct LiveMergeAdapter {
    health: ConnectionHealth,
    last_closed: Option<u64>,
}

impl LiveMergeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health
    }

    pub fn last_closed(&self) -> Option<u64> {
        self.last_closed
    }

    pub fn on_event(&mut self, store: &mut SeriesStore, event: StreamEvent) -> Option<LiveMerge> {
        match event {
            StreamEvent::Connected => {
                log::info!("Live stream connected");
                self.health = ConnectionHealth::Connected;
                None
            }
            StreamEvent::Disconnected(reason) => {
                log::warn!("Live stream disconnected: {reason}");
                self.health = ConnectionHealth::Reconnecting;
                None
            }
            StreamEvent::Tick(tick) => Some(self.on_tick(store, &tick)),
        }
    }

    pub fn on_tick(&mut self, store: &mut SeriesStore, tick: &Tick) -> LiveMerge {
        if tick.is_closed {
            self.last_closed = Some(tick.time);
        }

        if let Some(last) = store.last_bar_mut() {
            if last.time == tick.time {
                last.high = last.high.max(tick.high);
                last.low = last.low.min(tick.low);
                last.close = tick.close;
                last.volume = tick.volume;
                return LiveMerge::Updated;
            }
            if tick.time < last.time {
                log::debug!("Dropping late tick at {} behind {}", tick.time, last.time);
                return LiveMerge::Ignored;
            }
        }

        store.upsert_bar(tick.to_bar());
        LiveMerge::Appended
    }
}
