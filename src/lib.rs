pub mod cache;
pub mod catalog;
pub mod compress;
pub mod config;
pub mod migrate;
pub mod series;
pub mod state;
pub mod store;

// --- Library API for embedding ---

pub use cache::SeriesCache;
pub use catalog::{Catalog, ChangeNote};
pub use compress::{Compressor, Method};
pub use config::TrackerConfig;
pub use migrate::{MigrationOutcome, DB_VERSION};
pub use series::{
    encode_list_index, parse_list_index, ChangeEntry, Episode, EpisodeKey, EpisodeRef, SeasonKey,
    SeriesMeta, SeriesPayload, Stamp, StoreMeta,
};
pub use state::{
    find_single_series, indexed_series, last_seen_episode, next_unseen_episode, series_state,
    should_update, FindResult, ListFilter, State, UpdateTuning,
};
pub use store::{RollbackOutcome, Store};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

/// What a refresh pass did.
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    /// Series considered stale enough to ask the catalog about.
    pub checked: usize,
    /// Series whose payload was actually re-fetched.
    pub fetched: usize,
    pub failures: Vec<(String, anyhow::Error)>,
}

/// Async entry point. Owns the store, the episode cache and an optional
/// remote catalog; blocking file work runs under `spawn_blocking`.
pub struct Tracker {
    config: TrackerConfig,
    comp: Compressor,
    store: Store,
    cache: Arc<SeriesCache>,
    catalog: Option<Arc<dyn Catalog>>,
}

impl Tracker {
    /// Load the store (running schema migration and cache housekeeping) and
    /// wire up the episode cache. Saves immediately if migration changed
    /// anything.
    pub async fn load(
        config: TrackerConfig,
        catalog: Option<Arc<dyn Catalog>>,
    ) -> Result<Tracker> {
        let comp = Compressor::detect();
        let cache = Arc::new(SeriesCache::new(&config.series_cache, comp.clone())?);

        let base = config.series_db.clone();
        let load_comp = comp.clone();
        let loaded = tokio::task::spawn_blocking(move || store::load(&base, &load_comp)).await??;
        let store::Loaded { store, migration } = loaded;

        let mut tracker = Tracker { config, comp, store, cache, catalog };
        for note in &migration.notes {
            println!("[db: {note}]");
        }
        tracker.apply_externalized(migration.externalized).await;

        // the change log describes the previous run; start this one clean
        tracker.store.changelog_clear();
        tracker.clean_unused(Stamp::now());

        if tracker.store.is_dirty() {
            tracker.save().await?;
        }
        Ok(tracker)
    }

    /// Write migrated payloads into the episode cache (bulk, parallel) and
    /// recompute the derived metadata for every lifted series.
    async fn apply_externalized(&mut self, externalized: Vec<migrate::Externalized>) {
        if externalized.is_empty() {
            return;
        }
        let now = Stamp::now();
        let mut writes = Vec::new();
        for entry in externalized {
            let payload: SeriesPayload = match serde_json::from_value(entry.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    eprintln!("series {}: unusable payload: {err}", entry.series_id);
                    continue;
                }
            };
            let payload = Arc::new(payload);
            if let Some(meta) = self.store.get_mut(&entry.series_id) {
                state::update_meta(meta, &payload, now);
            }
            if entry.write_file {
                writes.push((entry.series_id, payload));
            }
        }
        for (series_id, err) in self.cache.set_many(writes).await {
            eprintln!("series {series_id}: writing cache file failed: {err:#}");
        }
    }

    /// Evict cached data of archived series that has not been used for
    /// longer than the configured retention.
    fn clean_unused(&mut self, now: Stamp) {
        let keep = self.config.remove_data_after();
        let archived: Vec<String> = self
            .store
            .iter()
            .filter(|(_, meta)| meta.is_archived())
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0usize;
        for series_id in archived {
            let recorded = self.store.get(&series_id).and_then(|meta| meta.last_used);
            let last_used = match recorded.or_else(|| self.cache.mtime(&series_id)) {
                Some(stamp) => {
                    if recorded.is_none() {
                        // adopt the file mtime as the best estimate
                        if let Some(meta) = self.store.get_mut(&series_id) {
                            meta.last_used = Some(stamp);
                        }
                    }
                    stamp
                }
                None => {
                    // no file either; mark as already expired and move on
                    if let Some(meta) = self.store.get_mut(&series_id) {
                        meta.last_used = Some(Stamp(now.0 - keep));
                    }
                    continue;
                }
            };

            if now.0 - last_used.0 > keep {
                if self.cache.remove(&series_id).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("evicted cached data for {removed} archived series");
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// Persist the store if dirty. Returns whether a write happened.
    pub async fn save(&mut self) -> Result<bool> {
        let mut store = std::mem::take(&mut self.store);
        let base = self.config.series_db.clone();
        let comp = self.comp.clone();
        let num_backups = self.config.num_backups;
        let (store, wrote) = tokio::task::spawn_blocking(move || {
            let wrote = store::save(&mut store, &base, &comp, num_backups);
            (store, wrote)
        })
        .await?;
        self.store = store;
        wrote
    }

    /// Full payload for a series: from the cache if available, otherwise
    /// fetched from the catalog (when one is wired) and cached. `Ok(None)`
    /// when the series is unknown or no data source can produce it.
    pub async fn series(&mut self, series_id: &str) -> Result<Option<Arc<SeriesPayload>>> {
        let cache = Arc::clone(&self.cache);
        let id = series_id.to_string();
        if let Some(payload) = tokio::task::spawn_blocking(move || cache.get(&id)).await? {
            return Ok(Some(payload));
        }

        if !self.store.contains(series_id) {
            return Ok(None);
        }
        let Some(catalog) = self.catalog.clone() else {
            return Ok(None);
        };

        debug!("series {series_id}: no cached data, fetching");
        let payload = Arc::new(catalog.fetch(series_id, true).await?);
        self.store_payload(series_id, Arc::clone(&payload), true).await?;
        Ok(Some(payload))
    }

    /// Replace a series' payload and recompute its derived metadata.
    pub async fn set_series(&mut self, series_id: &str, payload: SeriesPayload) -> Result<()> {
        self.store_payload(series_id, Arc::new(payload), true).await
    }

    async fn store_payload(
        &mut self,
        series_id: &str,
        payload: Arc<SeriesPayload>,
        real_update: bool,
    ) -> Result<()> {
        let cache = Arc::clone(&self.cache);
        let id = series_id.to_string();
        let write = Arc::clone(&payload);
        tokio::task::spawn_blocking(move || cache.set(&id, write)).await??;

        let now = Stamp::now();
        let max_history = self.config.num_update_history;
        let meta = self
            .store
            .get_mut(series_id)
            .with_context(|| format!("unknown series {series_id}"))?;
        state::update_meta(meta, &payload, now);
        meta.update_check = Some(now);
        if real_update {
            meta.add_update_stamp(now, max_history);
        }
        Ok(())
    }

    /// Track a new series. Returns its assigned list index.
    pub async fn add(&mut self, series_id: String, payload: SeriesPayload) -> Result<u32> {
        anyhow::ensure!(!self.store.contains(&series_id), "series {series_id} already tracked");

        let now = Stamp::now();
        let meta = SeriesMeta { added: Some(now), ..SeriesMeta::default() };
        let index = self.store.add(series_id.clone(), meta);
        self.store_payload(&series_id, Arc::new(payload), true).await?;
        Ok(index)
    }

    /// Stop tracking a series entirely (metadata and cached data).
    pub async fn remove(&mut self, series_id: &str) -> Result<Option<SeriesMeta>> {
        let removed = self.store.remove(series_id);
        if removed.is_some() {
            let cache = Arc::clone(&self.cache);
            let id = series_id.to_string();
            tokio::task::spawn_blocking(move || cache.remove(&id)).await??;
        }
        Ok(removed)
    }

    /// Mark episodes as seen (now). Returns how many were newly marked.
    pub async fn mark_seen(&mut self, series_id: &str, episodes: &[EpisodeKey]) -> Result<usize> {
        self.mark(series_id, episodes, true).await
    }

    /// Unmark episodes. Returns how many marks were removed.
    pub async fn mark_unseen(&mut self, series_id: &str, episodes: &[EpisodeKey]) -> Result<usize> {
        self.mark(series_id, episodes, false).await
    }

    async fn mark(&mut self, series_id: &str, episodes: &[EpisodeKey], seen: bool) -> Result<usize> {
        // payload may legitimately be missing; derived fields are then left
        // for the next refresh to settle
        let payload = self.series(series_id).await.unwrap_or_default();
        let now = Stamp::now();
        let meta = self
            .store
            .get_mut(series_id)
            .with_context(|| format!("unknown series {series_id}"))?;

        let mut changed = 0usize;
        for key in episodes {
            let hit = if seen {
                meta.seen.insert(*key, now).is_none()
            } else {
                meta.seen.remove(key).is_some()
            };
            if hit {
                changed += 1;
            }
        }

        if let Some(payload) = payload {
            state::update_meta(meta, &payload, now);
        }
        Ok(changed)
    }

    /// Shelve a series: stamp it archived and drop its cached data.
    /// Returns false if it was already archived.
    pub async fn archive(&mut self, series_id: &str) -> Result<bool> {
        let meta = self
            .store
            .get_mut(series_id)
            .with_context(|| format!("unknown series {series_id}"))?;
        if meta.is_archived() {
            return Ok(false);
        }
        meta.archived = Some(Stamp::now());

        let cache = Arc::clone(&self.cache);
        let id = series_id.to_string();
        tokio::task::spawn_blocking(move || cache.remove(&id)).await??;
        Ok(true)
    }

    /// Bring a series back from the archive; its payload is re-fetched
    /// lazily on next access. Returns false if it was not archived.
    pub fn restore(&mut self, series_id: &str) -> Result<bool> {
        let meta = self
            .store
            .get_mut(series_id)
            .with_context(|| format!("unknown series {series_id}"))?;
        Ok(meta.archived.take().is_some())
    }

    /// Attach a tag. Returns false if the series already carried it.
    pub fn tag(&mut self, series_id: &str, tag: &str) -> Result<bool> {
        let meta = self
            .store
            .get_mut(series_id)
            .with_context(|| format!("unknown series {series_id}"))?;
        Ok(meta.tags.insert(tag.to_string()))
    }

    /// Remove a tag. Returns false if the series did not carry it.
    pub fn untag(&mut self, series_id: &str, tag: &str) -> Result<bool> {
        let meta = self
            .store
            .get_mut(series_id)
            .with_context(|| format!("unknown series {series_id}"))?;
        Ok(meta.tags.remove(tag))
    }

    /// Record a verdict on a series. Ratings apply to finished viewing, so
    /// the series must be archived first.
    pub fn rate(&mut self, series_id: &str, rating: u32, comment: Option<String>) -> Result<()> {
        let meta = self
            .store
            .get(series_id)
            .with_context(|| format!("unknown series {series_id}"))?;
        anyhow::ensure!(meta.is_archived(), "\"{}\" is not archived", meta.title);
        if let Some(meta) = self.store.get_mut(series_id) {
            meta.rating = Some(rating);
            meta.rating_comment = comment;
        }
        Ok(())
    }

    /// Undo the most recent save by restoring backup slot 1, then reload.
    /// `Ok(None)` when there is no backup.
    pub async fn rollback(&mut self) -> Result<Option<RollbackOutcome>> {
        let base = self.config.series_db.clone();
        let comp = self.comp.clone();
        let num_backups = self.config.num_backups;
        let outcome =
            tokio::task::spawn_blocking(move || store::rollback(&base, &comp, num_backups))
                .await??;
        if outcome.is_some() {
            let base = self.config.series_db.clone();
            let comp = self.comp.clone();
            let loaded = tokio::task::spawn_blocking(move || store::load(&base, &comp)).await??;
            self.store = loaded.store;
        }
        Ok(outcome)
    }

    /// Existing backup files, most recent first.
    pub fn backups(&self) -> Vec<PathBuf> {
        store::list_backups(&self.config.series_db, self.config.num_backups)
    }

    /// Refresh stale series from the catalog. With `force`, every
    /// non-archived series is re-fetched regardless of staleness.
    pub async fn refresh(
        &mut self,
        force: bool,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<RefreshOutcome> {
        let catalog = self.catalog.clone().context("no catalog configured")?;
        let now = Stamp::now();
        let tuning = self.config.update_tuning();

        let candidates: Vec<String> = self
            .store
            .iter()
            .filter(|(_, meta)| {
                if force {
                    !meta.is_archived()
                } else {
                    state::should_update(meta, now.0, &tuning)
                }
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut outcome = RefreshOutcome { checked: candidates.len(), ..Default::default() };

        // cheap existence check first; full fetch only where something moved
        let mut to_fetch = Vec::new();
        for series_id in candidates {
            let Some(meta) = self.store.get(&series_id) else {
                continue;
            };
            let never_fetched = !self.cache.exists(&series_id);
            if force || never_fetched {
                to_fetch.push(series_id);
                continue;
            }
            let since = meta.update_history.last().copied().or(meta.update_check);
            match catalog.changes(&series_id, since).await {
                Ok(changes) if changes.is_empty() => {
                    // nothing new; just note that we looked
                    if let Some(meta) = self.store.get_mut(&series_id) {
                        meta.update_check = Some(now);
                    }
                }
                Ok(_) => to_fetch.push(series_id),
                Err(err) => outcome.failures.push((series_id, err)),
            }
        }

        let results = catalog::fetch_many(&catalog, to_fetch, true, &mut progress).await;
        for (series_id, result) in results {
            match result {
                Ok(payload) => {
                    self.store_payload(&series_id, Arc::new(payload), true).await?;
                    outcome.fetched += 1;
                }
                Err(err) => outcome.failures.push((series_id, err)),
            }
        }

        debug!(
            "refresh: {} checked, {} fetched, {} failed",
            outcome.checked,
            outcome.fetched,
            outcome.failures.len()
        );
        Ok(outcome)
    }
}
