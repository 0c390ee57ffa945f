use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::UpdateTuning;

const WEEK_SECS: u64 = 7 * 24 * 60 * 60;

/// User configuration, read from `config.toml` in the platform config
/// directory with environment-variable overrides on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrackerConfig {
    /// Base path of the store file (slot suffixes are appended).
    pub series_db: PathBuf,
    /// Directory holding the per-series episode cache.
    pub series_cache: PathBuf,
    pub num_backups: u32,
    pub num_update_history: usize,
    /// Cached data of archived series is evicted after this many days.
    pub remove_data_after_days: u32,
    /// Upper bound on the expected-update interval, in seconds.
    pub update_interval_cap_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let (data_dir, cache_dir) = match ProjectDirs::from("dev", "episodic", "episodic") {
            Some(dirs) => (dirs.data_dir().to_path_buf(), dirs.cache_dir().to_path_buf()),
            None => (PathBuf::from("."), PathBuf::from(".")),
        };
        TrackerConfig {
            series_db: data_dir.join("series"),
            series_cache: cache_dir,
            num_backups: 10,
            num_update_history: 5,
            remove_data_after_days: 30,
            update_interval_cap_secs: WEEK_SECS,
        }
    }
}

impl TrackerConfig {
    /// Read the config file if one exists, then apply env overrides.
    pub fn load() -> Result<TrackerConfig> {
        let mut config = match config_file() {
            Some(path) if path.is_file() => {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            _ => TrackerConfig::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        debug!("config: store at {}", config.series_db.display());
        Ok(config)
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(path) = get("EPISODIC_SERIES_DB") {
            self.series_db = PathBuf::from(path);
        }
        if let Some(path) = get("EPISODIC_SERIES_CACHE") {
            self.series_cache = PathBuf::from(path);
        }
        if let Some(count) = get("EPISODIC_NUM_BACKUPS").and_then(|v| v.parse().ok()) {
            self.num_backups = count;
        }
    }

    pub fn update_tuning(&self) -> UpdateTuning {
        UpdateTuning { interval_cap: Duration::seconds(self.update_interval_cap_secs as i64) }
    }

    pub fn remove_data_after(&self) -> Duration {
        Duration::days(self.remove_data_after_days as i64)
    }
}

fn config_file() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("dev", "episodic", "episodic")?;
    Some(dirs.config_dir().join("config.toml"))
}
