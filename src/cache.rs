use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::compress::Compressor;
use crate::series::{SeriesPayload, Stamp};

/// On-disk cache of full series payloads, one compressed file per series id
/// (no filename suffix; files are read with the active codec). Parsed
/// payloads are kept in memory, including negative entries for known misses.
pub struct SeriesCache {
    dir: PathBuf,
    comp: Compressor,
    mem: Mutex<HashMap<String, Option<Arc<SeriesPayload>>>>,
}

impl SeriesCache {
    /// Open (and create if needed) the cache under `<base>/series/`.
    pub fn new(base: &Path, comp: Compressor) -> Result<SeriesCache> {
        let dir = base.join("series");
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating cache directory {}", dir.display()))?;
        Ok(SeriesCache { dir, comp, mem: Mutex::new(HashMap::new()) })
    }

    pub fn path(&self, series_id: &str) -> PathBuf {
        self.dir.join(series_id)
    }

    fn mem(&self) -> MutexGuard<'_, HashMap<String, Option<Arc<SeriesPayload>>>> {
        self.mem.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a payload is available without contacting a remote catalog.
    pub fn exists(&self, series_id: &str) -> bool {
        if let Some(entry) = self.mem().get(series_id) {
            return entry.is_some();
        }
        self.path(series_id).is_file()
    }

    /// Modification time of the on-disk entry, used as a `last_used`
    /// fallback for eviction decisions.
    pub fn mtime(&self, series_id: &str) -> Option<Stamp> {
        let modified = fs::metadata(self.path(series_id)).and_then(|m| m.modified()).ok()?;
        Some(stamp_from(modified))
    }

    /// Fetch a payload, reading and parsing the on-disk file on first use.
    /// A missing or unreadable file means "no cached data", never an error.
    pub fn get(&self, series_id: &str) -> Option<Arc<SeriesPayload>> {
        if let Some(entry) = self.mem().get(series_id) {
            return entry.clone();
        }

        let path = self.path(series_id);
        let entry = if path.is_file() {
            match self.read_payload(&path) {
                Ok(payload) => Some(Arc::new(payload)),
                Err(err) => {
                    warn!("cache: discarding unreadable {}: {err:#}", path.display());
                    None
                }
            }
        } else {
            None
        };
        self.mem().insert(series_id.to_string(), entry.clone());
        entry
    }

    fn read_payload(&self, path: &Path) -> Result<SeriesPayload> {
        let reader = self.comp.open(path)?;
        serde_json::from_reader(reader)
            .with_context(|| format!("parsing cached series {}", path.display()))
    }

    /// Store a payload, replacing any previous entry. The file is written to
    /// a temporary sibling first and compressed into place.
    pub fn set(&self, series_id: &str, payload: Arc<SeriesPayload>) -> Result<()> {
        let tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("creating temp file in {}", self.dir.display()))?;
        serde_json::to_writer(&tmp, payload.as_ref())
            .with_context(|| format!("serializing series {series_id}"))?;
        self.comp.compress_file(tmp.path(), &self.path(series_id))?;
        self.mem().insert(series_id.to_string(), Some(payload));
        Ok(())
    }

    /// Drop a series from memory and disk. Missing files are fine.
    pub fn remove(&self, series_id: &str) -> Result<()> {
        self.mem().remove(series_id);
        let path = self.path(series_id);
        if path.is_file() {
            fs::remove_file(&path)
                .with_context(|| format!("removing cached series {}", path.display()))?;
        }
        Ok(())
    }

    /// Write many payloads in parallel blocking tasks. Returns the failures;
    /// an empty vec means everything landed.
    pub async fn set_many(
        self: &Arc<Self>,
        entries: Vec<(String, Arc<SeriesPayload>)>,
    ) -> Vec<(String, anyhow::Error)> {
        let mut tasks = JoinSet::new();
        for (series_id, payload) in entries {
            let cache = Arc::clone(self);
            tasks.spawn_blocking(move || {
                let result = cache.set(&series_id, payload);
                (series_id, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((series_id, Err(err))) => failures.push((series_id, err)),
                Err(err) => failures.push(("<task>".to_string(), err.into())),
            }
        }
        if !failures.is_empty() {
            debug!("cache: {} bulk writes failed", failures.len());
        }
        failures
    }
}

fn stamp_from(time: SystemTime) -> Stamp {
    Stamp(chrono::DateTime::<chrono::Local>::from(time).naive_local())
}
