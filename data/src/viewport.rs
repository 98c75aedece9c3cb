use crate::series::RenderRow;

/// Visible window in logical bar indices, fractional at either end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogicalRange {
    pub from: f64,
    pub to: f64,
}

impl LogicalRange {
    pub fn new(from: f64, to: f64) -> Self {
        Self { from, to }
    }

    pub fn width(&self) -> f64 {
        self.to - self.from
    }

    pub fn shifted(&self, bars: i64) -> Self {
        let offset = bars as f64;
        Self {
            from: self.from + offset,
            to: self.to + offset,
        }
    }
}

/// Rendering target for the series. Indices are positions in the row list last set.
pub trait ChartSurface {
    fn set_series(&mut self, rows: Vec<RenderRow>);

    fn visible_logical_range(&self) -> Option<LogicalRange>;

    fn set_visible_logical_range(&mut self, range: LogicalRange);
}

/// Keeps the same bars on screen after entries are inserted left of the view.
pub struct ViewportPreserver;

impl ViewportPreserver {
    /// Shifts the surface's visible range right by `inserted` entries.
    ///
    /// Must run after the new rows were handed to the surface. Returns the range
    /// now in effect, if the surface had one.
    pub fn shift_after_prepend<S: ChartSurface>(
        surface: &mut S,
        inserted: i64,
    ) -> Option<LogicalRange> {
        let current = surface.visible_logical_range()?;
        if inserted == 0 {
            return Some(current);
        }

        let shifted = current.shifted(inserted);
        surface.set_visible_logical_range(shifted);
        Some(shifted)
    }
}
