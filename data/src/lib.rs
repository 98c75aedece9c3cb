pub mod backfill;
pub mod config;
pub mod cursor;
pub mod feed;
pub mod live;
pub mod placeholder;
pub mod series;
pub mod session;
pub mod viewport;

use std::path::PathBuf;

pub use backfill::{BackfillScheduler, BackfillState, FailureCounter, PageOutcome};
pub use config::{ConfigError, EngineConfig};
pub use feed::{ChartFeed, Command};
pub use series::{RenderRow, SeriesStore};
pub use session::{Session, SessionContext};
pub use viewport::{ChartSurface, LogicalRange, ViewportPreserver};

pub const DATA_PATH_ENV: &str = "CHARTFILL_DATA_PATH";

/// Directory for config and logs, or a file inside it.
pub fn data_path(path_name: Option<&str>) -> PathBuf {
    let base = if let Ok(path) = std::env::var(DATA_PATH_ENV) {
        PathBuf::from(path)
    } else {
        dirs_next::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chartfill")
    };

    match path_name {
        Some(name) => base.join(name),
        None => base,
    }
}
