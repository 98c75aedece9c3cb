use exchange::{Bar, Timeframe};

use std::collections::BTreeMap;

/// Whitespace marker occupying axis space left of the oldest real bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    pub time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Entry {
    Bar(Bar),
    Placeholder(Placeholder),
}

impl Entry {
    pub fn time(&self) -> u64 {
        match self {
            Entry::Bar(bar) => bar.time,
            Entry::Placeholder(p) => p.time,
        }
    }

    pub fn as_bar(&self) -> Option<&Bar> {
        match self {
            Entry::Bar(bar) => Some(bar),
            Entry::Placeholder(_) => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Entry::Placeholder(_))
    }
}

/// Flat OHLC row handed to the rendering surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRow {
    pub time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_placeholder: bool,
}

/// Run of missing bars between two consecutive real bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Newest bar before the hole
    pub after: u64,
    /// Oldest bar after the hole
    pub before: u64,
    pub missing: u64,
}

/// Canonical time-ordered set of bars and placeholders for one session.
///
/// Keys are unique by construction; a bar always displaces a placeholder at the
/// same time. Oldest and newest real-bar times are cached.
#[derive(Debug, Clone)]
pub struct SeriesStore {
    entries: BTreeMap<u64, Entry>,
    interval: Timeframe,
    bar_count: usize,
    oldest_bar: Option<u64>,
    newest_bar: Option<u64>,
}

impl SeriesStore {
    pub fn new(interval: Timeframe) -> Self {
        Self {
            entries: BTreeMap::new(),
            interval,
            bar_count: 0,
            oldest_bar: None,
            newest_bar: None,
        }
    }

    pub fn interval(&self) -> Timeframe {
        self.interval
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bar_count(&self) -> usize {
        self.bar_count
    }

    pub fn placeholder_count(&self) -> usize {
        self.entries.len() - self.bar_count
    }

    pub fn oldest_bar_time(&self) -> Option<u64> {
        self.oldest_bar
    }

    pub fn newest_bar_time(&self) -> Option<u64> {
        self.newest_bar
    }

    pub fn get(&self, time: u64) -> Option<&Entry> {
        self.entries.get(&time)
    }

    pub fn contains_bar(&self, time: u64) -> bool {
        matches!(self.entries.get(&time), Some(Entry::Bar(_)))
    }

    pub fn is_occupied(&self, time: u64) -> bool {
        self.entries.contains_key(&time)
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.newest_bar
            .and_then(|time| self.entries.get(&time))
            .and_then(Entry::as_bar)
    }

    pub fn last_bar_mut(&mut self) -> Option<&mut Bar> {
        let time = self.newest_bar?;
        match self.entries.get_mut(&time) {
            Some(Entry::Bar(bar)) => Some(bar),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn bars(&self) -> impl Iterator<Item = &Bar> {
        self.entries.values().filter_map(Entry::as_bar)
    }

    /// Logical index of the entry at `time`, as the rendering surface counts it.
    pub fn index_of(&self, time: u64) -> Option<usize> {
        if !self.entries.contains_key(&time) {
            return None;
        }
        Some(self.entries.range(..time).count())
    }

    /// Inserts bars, displacing placeholders at colliding times.
    ///
    /// Bars already present are left untouched. Returns how many bars were new.
    pub fn merge(&mut self, bars: &[Bar]) -> usize {
        let mut inserted = 0;

        for bar in bars {
            match self.entries.get(&bar.time) {
                Some(Entry::Bar(_)) => continue,
                Some(Entry::Placeholder(_)) | None => {
                    self.entries.insert(bar.time, Entry::Bar(*bar));
                    self.note_bar(bar.time);
                    inserted += 1;
                }
            }
        }

        inserted
    }

    /// Inserts or overwrites a single bar. Used at the live tail.
    pub fn upsert_bar(&mut self, bar: Bar) -> bool {
        match self.entries.insert(bar.time, Entry::Bar(bar)) {
            Some(Entry::Bar(_)) => false,
            Some(Entry::Placeholder(_)) | None => {
                self.note_bar(bar.time);
                true
            }
        }
    }

    /// Adds a placeholder unless the time is already occupied.
    pub fn insert_placeholder(&mut self, time: u64) -> bool {
        if self.entries.contains_key(&time) {
            return false;
        }
        self.entries.insert(time, Entry::Placeholder(Placeholder { time }));
        true
    }

    /// Removes the `count` oldest placeholders. Returns how many were removed.
    pub fn evict_oldest_placeholders(&mut self, count: usize) -> usize {
        let victims: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_placeholder())
            .map(|(time, _)| *time)
            .take(count)
            .collect();

        for time in &victims {
            self.entries.remove(time);
        }
        victims.len()
    }

    /// Normalizes the series after bulk mutation.
    ///
    /// Placeholders stranded inside or after the real-bar span are dropped and the
    /// cached bounds are rebuilt. Returns the number of placeholders removed.
    pub fn reconcile(&mut self) -> usize {
        let before = self.entries.len();

        let oldest = self.bars().next().map(|bar| bar.time);
        if let Some(oldest) = oldest {
            self.entries
                .retain(|time, entry| !(entry.is_placeholder() && *time > oldest));
        }

        let bar_count = self.bars().count();
        let oldest = self.bars().next().map(|bar| bar.time);
        let newest = self.bars().last().map(|bar| bar.time);

        self.bar_count = bar_count;
        self.oldest_bar = oldest;
        self.newest_bar = newest;

        before - self.entries.len()
    }

    /// Holes between consecutive real bars. Tolerated, but reported.
    pub fn missing_bars(&self) -> Vec<Gap> {
        let step = self.interval.to_seconds();
        let mut gaps = Vec::new();
        let mut previous: Option<u64> = None;

        for bar in self.bars() {
            if let Some(prev) = previous
                && bar.time - prev > step
            {
                gaps.push(Gap {
                    after: prev,
                    before: bar.time,
                    missing: (bar.time - prev) / step - 1,
                });
            }
            previous = Some(bar.time);
        }

        gaps
    }

    /// Flattens the series for the rendering surface.
    ///
    /// Placeholders carry the opening price of the next newer real bar in all four
    /// price fields so they stay flat and never widen the price scale.
    pub fn render_rows(&self) -> Vec<RenderRow> {
        let mut rows = Vec::with_capacity(self.entries.len());
        let mut next_open = None;

        for entry in self.entries.values().rev() {
            let row = match entry {
                Entry::Bar(bar) => {
                    next_open = Some(bar.open);
                    RenderRow {
                        time: bar.time,
                        open: bar.open,
                        high: bar.high,
                        low: bar.low,
                        close: bar.close,
                        volume: bar.volume,
                        is_placeholder: false,
                    }
                }
                Entry::Placeholder(p) => {
                    let price = next_open.unwrap_or(0.0);
                    RenderRow {
                        time: p.time,
                        open: price,
                        high: price,
                        low: price,
                        close: price,
                        volume: 0.0,
                        is_placeholder: true,
                    }
                }
            };
            rows.push(row);
        }

        rows.reverse();
        rows
    }

    fn note_bar(&mut self, time: u64) {
        self.bar_count += 1;
        self.oldest_bar = Some(self.oldest_bar.map_or(time, |t| t.min(time)));
        self.newest_bar = Some(self.newest_bar.map_or(time, |t| t.max(time)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: u64 = 900;

    fn bar(time: u64) -> Bar {
        Bar::new(time, 10.0, 12.0, 9.0, 11.0, 1.0)
    }

    fn bars(from: u64, count: u64) -> Vec<Bar> {
        (0..count).map(|i| bar(from + i * STEP)).collect()
    }

    fn assert_strictly_increasing(store: &SeriesStore) {
        let times: Vec<u64> = store.iter().map(Entry::time).collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]), "{times:?}");
    }

    #[test]
    fn merge_counts_only_new_bars() {
        let mut store = SeriesStore::new(Timeframe::M15);

        assert_eq!(store.merge(&bars(STEP * 10, 5)), 5);
        assert_eq!(store.merge(&bars(STEP * 8, 5)), 2);
        assert_eq!(store.bar_count(), 7);
        assert_eq!(store.oldest_bar_time(), Some(STEP * 8));
        assert_eq!(store.newest_bar_time(), Some(STEP * 14));
        assert_strictly_increasing(&store);
    }

    #[test]
    fn merging_known_page_is_idempotent() {
        let mut store = SeriesStore::new(Timeframe::M15);
        store.merge(&bars(STEP * 10, 20));
        for t in 1..5 {
            store.insert_placeholder(STEP * 10 - t * STEP);
        }
        let before = store.render_rows();

        assert_eq!(store.merge(&bars(STEP * 12, 10)), 0);
        assert_eq!(store.render_rows(), before);
    }

    #[test]
    fn bar_displaces_placeholder() {
        let mut store = SeriesStore::new(Timeframe::M15);
        store.merge(&bars(STEP * 10, 2));
        assert!(store.insert_placeholder(STEP * 9));
        assert!(!store.insert_placeholder(STEP * 10));

        assert_eq!(store.merge(&[bar(STEP * 9)]), 1);
        assert_eq!(store.placeholder_count(), 0);
        assert!(store.contains_bar(STEP * 9));
        assert_eq!(store.oldest_bar_time(), Some(STEP * 9));
    }

    #[test]
    fn reconcile_drops_stranded_placeholders() {
        let mut store = SeriesStore::new(Timeframe::M15);
        store.merge(&bars(STEP * 10, 3));
        store.insert_placeholder(STEP * 9);
        // hole inside the bar span
        store.merge(&[bar(STEP * 20)]);
        store.insert_placeholder(STEP * 15);

        assert_eq!(store.reconcile(), 1);
        assert!(store.get(STEP * 9).is_some_and(Entry::is_placeholder));
        assert!(store.get(STEP * 15).is_none());
        assert_eq!(store.bar_count(), 4);
        assert_eq!(store.oldest_bar_time(), Some(STEP * 10));
        assert_eq!(store.newest_bar_time(), Some(STEP * 20));
        assert_strictly_increasing(&store);
    }

    #[test]
    fn eviction_removes_oldest_placeholders_first() {
        let mut store = SeriesStore::new(Timeframe::M15);
        store.merge(&bars(STEP * 10, 1));
        for t in 1..=5 {
            store.insert_placeholder(STEP * 10 - t * STEP);
        }

        assert_eq!(store.evict_oldest_placeholders(2), 2);
        assert!(store.get(STEP * 5).is_none());
        assert!(store.get(STEP * 6).is_none());
        assert!(store.get(STEP * 7).is_some());
    }

    #[test]
    fn placeholders_render_flat_at_adjoining_open() {
        let mut store = SeriesStore::new(Timeframe::M15);
        store.merge(&[Bar::new(STEP * 10, 42.0, 50.0, 40.0, 45.0, 3.0)]);
        store.insert_placeholder(STEP * 9);
        store.insert_placeholder(STEP * 8);

        let rows = store.render_rows();

        assert_eq!(rows.len(), 3);
        for row in &rows[..2] {
            assert!(row.is_placeholder);
            assert_eq!((row.open, row.high, row.low, row.close), (42.0, 42.0, 42.0, 42.0));
        }
        assert!(!rows[2].is_placeholder);
    }

    #[test]
    fn gaps_are_reported_not_rejected() {
        let mut store = SeriesStore::new(Timeframe::M15);
        store.merge(&bars(0, 3));
        store.merge(&bars(STEP * 10, 2));

        assert_eq!(
            store.missing_bars(),
            vec![Gap {
                after: STEP * 2,
                before: STEP * 10,
                missing: 7
            }]
        );
    }

    #[test]
    fn upsert_overwrites_tail() {
        let mut store = SeriesStore::new(Timeframe::M15);
        store.merge(&bars(0, 2));

        assert!(!store.upsert_bar(Bar::new(STEP, 1.0, 1.0, 1.0, 1.0, 1.0)));
        assert_eq!(store.last_bar().map(|b| b.open), Some(1.0));
        assert!(store.upsert_bar(bar(STEP * 2)));
        assert_eq!(store.newest_bar_time(), Some(STEP * 2));
        assert_eq!(store.index_of(STEP * 2), Some(2));
    }
}
