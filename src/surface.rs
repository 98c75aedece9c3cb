use data::{ChartSurface, Command, LogicalRange, RenderRow};
use tokio::sync::mpsc;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

#[derive(Debug, Default)]
struct SurfaceState {
    rows: Vec<RenderRow>,
    range: Option<LogicalRange>,
}

/// Chart surface without a screen. Clones share the same series and viewport.
#[derive(Debug, Clone, Default)]
pub struct HeadlessSurface {
    state: Arc<Mutex<SurfaceState>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub rows: usize,
    pub placeholders: usize,
    pub range: Option<LogicalRange>,
}

impl HeadlessSurface {
    fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the view `step_bars` to the left, stopping at index 0.
    ///
    /// The first call on a non-empty series opens a view of `visible_bars` on the
    /// newest entries instead.
    pub fn pan_left(&self, visible_bars: f64, step_bars: f64) -> Option<LogicalRange> {
        let mut state = self.lock();
        if state.rows.is_empty() {
            return None;
        }

        let range = match state.range {
            None => {
                let end = state.rows.len() as f64;
                LogicalRange::new((end - visible_bars).max(0.0), end)
            }
            Some(current) => {
                let from = (current.from - step_bars).max(0.0);
                LogicalRange::new(from, from + current.width())
            }
        };

        state.range = Some(range);
        Some(range)
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            rows: state.rows.len(),
            placeholders: state.rows.iter().filter(|row| row.is_placeholder).count(),
            range: state.range,
        }
    }
}

impl ChartSurface for HeadlessSurface {
    fn set_series(&mut self, rows: Vec<RenderRow>) {
        let mut state = self.lock();
        if rows.is_empty() {
            state.range = None;
        }
        state.rows = rows;
    }

    fn visible_logical_range(&self) -> Option<LogicalRange> {
        self.lock().range
    }

    fn set_visible_logical_range(&mut self, range: LogicalRange) {
        self.lock().range = Some(range);
    }
}

/// Stand-in for a user dragging the chart left at a steady pace.
pub async fn simulate_panning(
    surface: HeadlessSurface,
    commands: mpsc::Sender<Command>,
    visible_bars: f64,
    step_bars: f64,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    let mut steps: u64 = 0;

    loop {
        interval.tick().await;

        let Some(range) = surface.pan_left(visible_bars, step_bars) else {
            continue;
        };
        if commands
            .send(Command::VisibleRangeChanged(range))
            .await
            .is_err()
        {
            break;
        }

        steps += 1;
        if steps % 10 == 0 {
            let snapshot = surface.snapshot();
            log::info!(
                "view {:.0}..{:.0} of {} entries ({} placeholders)",
                range.from,
                range.to,
                snapshot.rows,
                snapshot.placeholders
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(time: u64, is_placeholder: bool) -> RenderRow {
        RenderRow {
            time,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
            is_placeholder,
        }
    }

    #[test]
    fn first_pan_opens_view_on_newest_entries() {
        let mut surface = HeadlessSurface::default();
        assert_eq!(surface.pan_left(100.0, 10.0), None);

        surface.set_series((0..500).map(|t| row(t, t < 50)).collect());

        assert_eq!(
            surface.pan_left(100.0, 10.0),
            Some(LogicalRange::new(400.0, 500.0))
        );
        assert_eq!(
            surface.pan_left(100.0, 10.0),
            Some(LogicalRange::new(390.0, 490.0))
        );
        assert_eq!(surface.snapshot().placeholders, 50);
    }

    #[test]
    fn pan_stops_at_first_entry() {
        let mut surface = HeadlessSurface::default();
        surface.set_series((0..50).map(|t| row(t, false)).collect());
        surface.set_visible_logical_range(LogicalRange::new(5.0, 45.0));

        assert_eq!(
            surface.pan_left(40.0, 20.0),
            Some(LogicalRange::new(0.0, 40.0))
        );
    }

    #[test]
    fn clones_share_viewport() {
        let surface = HeadlessSurface::default();
        let mut writer = surface.clone();

        writer.set_visible_logical_range(LogicalRange::new(1.0, 2.0));
        assert_eq!(
            surface.visible_logical_range(),
            Some(LogicalRange::new(1.0, 2.0))
        );
    }
}
