use crate::cursor::{StepPolicies, StepPolicy};

use exchange::{MAX_PAGE_LIMIT, ResolutionClass, Timeframe};
use serde::{Deserialize, Serialize};

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_PATH_ENV: &str = "CHARTFILL_CONFIG";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("Parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Tunables for backfill, buffering and live merge.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fraction of the visible width counted as "near the left edge"
    pub proximity_factor: f64,
    pub cooldown_ms: u64,
    pub max_concurrent_backfills: usize,
    pub page_limit: usize,
    pub initial_limit: usize,
    /// Hard failures in a row before history is declared exhausted
    pub failure_threshold: u32,
    /// Already-known pages that add up to one hard failure
    pub soft_misses_per_failure: u32,
    /// Distance from logical index 0 that always counts as "at the edge"
    pub edge_epsilon_bars: f64,
    pub left_buffer_bars: usize,
    pub max_placeholders: usize,
    /// Extra intervals subtracted from the cursor when building a request
    pub overshoot_bars: u64,
    pub live_reconnect_delay_ms: u64,
    pub step_policy: StepPolicies,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proximity_factor: 0.5,
            cooldown_ms: 750,
            max_concurrent_backfills: 2,
            page_limit: MAX_PAGE_LIMIT,
            initial_limit: MAX_PAGE_LIMIT,
            failure_threshold: 3,
            soft_misses_per_failure: 3,
            edge_epsilon_bars: 10.0,
            left_buffer_bars: 500,
            max_placeholders: 5_000,
            overshoot_bars: 0,
            live_reconnect_delay_ms: 2_000,
            step_policy: StepPolicies::default(),
        }
    }
}

impl EngineConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn live_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.live_reconnect_delay_ms)
    }

    pub fn page_limit(&self) -> usize {
        self.page_limit.clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn initial_limit(&self) -> usize {
        self.initial_limit.max(1)
    }

    pub fn policy_for(&self, timeframe: Timeframe) -> StepPolicy {
        self.step_policy.for_timeframe(timeframe)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.proximity_factor.is_finite() && self.proximity_factor > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "proximity_factor must be positive, got {}",
                self.proximity_factor
            )));
        }
        if self.max_concurrent_backfills == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_backfills must be at least 1".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.soft_misses_per_failure == 0 {
            return Err(ConfigError::Invalid(
                "soft_misses_per_failure must be at least 1".to_string(),
            ));
        }
        for class in [
            ResolutionClass::Fine,
            ResolutionClass::Medium,
            ResolutionClass::Coarse,
        ] {
            let policy = self.step_policy.for_class(class);
            if policy.max_gap_bars >= policy.empty_step {
                return Err(ConfigError::Invalid(format!(
                    "{class} max_gap_bars ({}) must be below empty_step ({})",
                    policy.max_gap_bars, policy.empty_step
                )));
            }
        }
        if self.left_buffer_bars > self.max_placeholders {
            return Err(ConfigError::Invalid(format!(
                "left_buffer_bars ({}) exceeds max_placeholders ({})",
                self.left_buffer_bars, self.max_placeholders
            )));
        }
        Ok(())
    }

    /// Reads and validates a config file.
    ///
    /// A missing file yields defaults. A file that fails to parse is renamed to
    /// `<stem>_old.<ext>` next to it so it can be restored by hand.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<EngineConfig>(&contents) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                let backup_path = backup_path(path);

                if let Err(rename_err) = fs::rename(path, &backup_path) {
                    log::warn!(
                        "Failed to backup corrupted config '{}' to '{}': {}",
                        path.display(),
                        backup_path.display(),
                        rename_err
                    );
                } else {
                    log::info!(
                        "Backed up corrupted config to '{}'. It can be restored manually.",
                        backup_path.display()
                    );
                }

                Err(e.into())
            }
        }
    }

    /// Like [`EngineConfig::load`], falling back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            log::error!("Failed to load config from {}: {e}", path.display());
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Config location: `CHARTFILL_CONFIG` if set, otherwise inside the data directory.
pub fn config_path() -> PathBuf {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => PathBuf::from(path),
        Err(_) => crate::data_path(Some(CONFIG_FILE)),
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let file_name = match path.extension() {
        Some(ext) => format!("{stem}_old.{}", ext.to_string_lossy()),
        None => format!("{stem}_old"),
    };

    path.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("chartfill-{name}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.cooldown(), Duration::from_millis(750));
        assert_eq!(config.page_limit(), 1000);
    }

    #[test]
    fn page_limit_is_clamped() {
        let config = EngineConfig {
            page_limit: 5_000,
            ..Default::default()
        };
        assert_eq!(config.page_limit(), 1000);

        let config = EngineConfig {
            page_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.page_limit(), 1);
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let bad = [
            EngineConfig {
                proximity_factor: 0.0,
                ..Default::default()
            },
            EngineConfig {
                max_concurrent_backfills: 0,
                ..Default::default()
            },
            EngineConfig {
                failure_threshold: 0,
                ..Default::default()
            },
            EngineConfig {
                left_buffer_bars: 10,
                max_placeholders: 5,
                ..Default::default()
            },
        ];

        for config in bad {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn gap_tolerance_must_stay_below_empty_step() {
        let mut config = EngineConfig::default();
        config.step_policy.medium.max_gap_bars = config.step_policy.medium.empty_step;

        let Err(ConfigError::Invalid(reason)) = config.validate() else {
            panic!("gap tolerance equal to empty_step should be rejected");
        };
        assert!(reason.starts_with("medium max_gap_bars"));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = scratch_dir("partial");
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, r#"{ "cooldown_ms": 200, "left_buffer_bars": 50 }"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();

        assert_eq!(config.cooldown_ms, 200);
        assert_eq!(config.left_buffer_bars, 50);
        assert_eq!(config.max_concurrent_backfills, 2);
        assert_eq!(config.step_policy, StepPolicies::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = scratch_dir("missing");
        let config = EngineConfig::load(&dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn corrupt_file_is_backed_up() {
        let dir = scratch_dir("corrupt");
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse(_))));
        assert!(!path.exists());
        assert!(dir.join("config_old.json").exists());
        assert_eq!(EngineConfig::load_or_default(&path), EngineConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = scratch_dir("save");
        let path = dir.join("nested").join(CONFIG_FILE);
        let config = EngineConfig {
            overshoot_bars: 3,
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }
}
