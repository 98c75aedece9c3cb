use crate::series::SeriesStore;

/// Net effect of a buffer pass on the series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferChange {
    pub added: usize,
    pub evicted: usize,
}

impl BufferChange {
    pub fn net(&self) -> i64 {
        self.added as i64 - self.evicted as i64
    }
}

/// Keeps a run of whitespace entries left of the oldest real bar so the user can
/// pan into empty space while older history loads.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderBuffer {
    target: usize,
    max_len: usize,
}

impl PlaceholderBuffer {
    pub fn new(target: usize, max_len: usize) -> Self {
        Self {
            target: target.min(max_len),
            max_len,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Inserts up to `count` placeholders at successive intervals before the
    /// oldest real bar, skipping occupied times, then trims the oldest
    /// placeholders beyond the configured maximum.
    pub fn ensure_left_buffer(&self, store: &mut SeriesStore, count: usize) -> BufferChange {
        let Some(oldest) = store.oldest_bar_time() else {
            return BufferChange::default();
        };
        let step = store.interval().to_seconds();

        let mut change = BufferChange::default();
        for i in 1..=count as u64 {
            let Some(time) = i.checked_mul(step).and_then(|back| oldest.checked_sub(back)) else {
                break;
            };
            if store.insert_placeholder(time) {
                change.added += 1;
            }
        }

        let excess = store.placeholder_count().saturating_sub(self.max_len);
        if excess > 0 {
            change.evicted = store.evict_oldest_placeholders(excess);
        }

        change
    }

    /// Re-normalizes the series after real bars landed inside the buffer and
    /// refills it up to the target.
    pub fn reconcile(&self, store: &mut SeriesStore) -> BufferChange {
        let stranded = store.reconcile();
        let mut change = self.ensure_left_buffer(store, self.target);
        change.evicted += stranded;
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exchange::{Bar, Timeframe};

    const STEP: u64 = 3_600;

    fn store_with_bar_at(time: u64) -> SeriesStore {
        let mut store = SeriesStore::new(Timeframe::H1);
        store.merge(&[Bar::new(time, 1.0, 1.0, 1.0, 1.0, 0.0)]);
        store
    }

    #[test]
    fn fills_before_oldest_bar() {
        let mut store = store_with_bar_at(STEP * 100);
        let buffer = PlaceholderBuffer::new(10, 50);

        let change = buffer.ensure_left_buffer(&mut store, 10);

        assert_eq!(change, BufferChange { added: 10, evicted: 0 });
        assert_eq!(store.placeholder_count(), 10);
        assert!(store.get(STEP * 90).is_some_and(|e| e.is_placeholder()));
        assert!(store.get(STEP * 89).is_none());
    }

    #[test]
    fn repeated_passes_do_not_duplicate() {
        let mut store = store_with_bar_at(STEP * 100);
        let buffer = PlaceholderBuffer::new(10, 50);

        buffer.ensure_left_buffer(&mut store, 10);
        let change = buffer.ensure_left_buffer(&mut store, 10);

        assert_eq!(change.added, 0);
        assert_eq!(store.placeholder_count(), 10);
    }

    #[test]
    fn stops_at_epoch() {
        let mut store = store_with_bar_at(STEP * 3);
        let buffer = PlaceholderBuffer::new(10, 50);

        assert_eq!(buffer.ensure_left_buffer(&mut store, 10).added, 3);
    }

    #[test]
    fn never_exceeds_cap() {
        let mut store = store_with_bar_at(STEP * 1_000);
        let buffer = PlaceholderBuffer::new(5, 8);
        buffer.ensure_left_buffer(&mut store, 5);

        // history moved left, so the buffer grows in front of the old one
        store.merge(&[Bar::new(STEP * 990, 1.0, 1.0, 1.0, 1.0, 0.0)]);
        let change = buffer.reconcile(&mut store);

        assert!(store.placeholder_count() <= 8);
        assert_eq!(store.placeholder_count(), 5);
        assert!(change.evicted >= 4);
        assert!(store.get(STEP * 985).is_some_and(|e| e.is_placeholder()));
    }

    #[test]
    fn overflow_evicts_farthest_placeholders() {
        let mut store = store_with_bar_at(STEP * 1_000);
        let buffer = PlaceholderBuffer::new(5, 8);

        let change = buffer.ensure_left_buffer(&mut store, 20);

        assert_eq!(change, BufferChange { added: 20, evicted: 12 });
        assert_eq!(store.placeholder_count(), 8);
        assert!(store.get(STEP * 992).is_some());
        assert!(store.get(STEP * 991).is_none());
    }

    #[test]
    fn empty_series_gets_no_buffer() {
        let mut store = SeriesStore::new(Timeframe::H1);
        let change = PlaceholderBuffer::new(10, 50).ensure_left_buffer(&mut store, 10);

        assert_eq!(change.net(), 0);
        assert!(store.is_empty());
    }
}
