use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::compress::{Compressor, Method, KNOWN_EXTENSIONS};
use crate::migrate::{self, MigrationOutcome, DB_VERSION};
use crate::series::{ChangeEntry, SeriesMeta, StoreMeta};

/// The root persisted object: per-series metadata plus global bookkeeping
/// under the reserved `"epm:meta"` key. Mutations go through methods that
/// mark the store dirty; `save` is a no-op while clean.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "epm:meta")]
    meta: StoreMeta,
    #[serde(flatten)]
    series: BTreeMap<String, SeriesMeta>,
    #[serde(skip)]
    dirty: bool,
}

impl Store {
    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Number of tracked series (the reserved entry never counts).
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn contains(&self, series_id: &str) -> bool {
        self.series.contains_key(series_id)
    }

    pub fn get(&self, series_id: &str) -> Option<&SeriesMeta> {
        self.series.get(series_id)
    }

    /// Mutable access marks the store dirty; callers only reach for this
    /// when they are about to change something.
    pub fn get_mut(&mut self, series_id: &str) -> Option<&mut SeriesMeta> {
        let entry = self.series.get_mut(series_id);
        if entry.is_some() {
            self.dirty = true;
        }
        entry
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SeriesMeta)> {
        self.series.iter()
    }

    pub fn series_ids(&self) -> impl Iterator<Item = &String> {
        self.series.keys()
    }

    /// Insert or replace a series entry as-is (list index management is the
    /// caller's business; see `add`).
    pub fn insert(&mut self, series_id: String, meta: SeriesMeta) {
        self.series.insert(series_id, meta);
        self.dirty = true;
    }

    /// Add a new series, assigning the next free list index.
    pub fn add(&mut self, series_id: String, mut meta: SeriesMeta) -> u32 {
        let index = self.meta.next_list_index;
        meta.list_index = index;
        self.meta.next_list_index += 1;
        self.series.insert(series_id, meta);
        self.dirty = true;
        index
    }

    /// Remove a series entry. Deleting the most recently added series hands
    /// its list index back.
    pub fn remove(&mut self, series_id: &str) -> Option<SeriesMeta> {
        let removed = self.series.remove(series_id)?;
        if removed.list_index + 1 == self.meta.next_list_index {
            self.meta.next_list_index -= 1;
        }
        self.dirty = true;
        Some(removed)
    }

    pub fn changelog(&self) -> &[ChangeEntry] {
        &self.meta.changes_log
    }

    pub fn changelog_add(&mut self, message: impl Into<String>, series_id: Option<&str>) {
        let message = message.into();
        debug!("logged change: {message}");
        self.meta.changes_log.push(ChangeEntry(message, series_id.map(str::to_string)));
        self.dirty = true;
    }

    /// Clear the log without dirtying the store: stale entries from an
    /// already-saved run are dropped silently at startup.
    pub fn changelog_clear(&mut self) {
        self.meta.changes_log.clear();
    }
}

/// Result of loading a store from disk.
#[derive(Debug)]
pub struct Loaded {
    pub store: Store,
    pub migration: MigrationOutcome,
}

/// Backup/live slot path: `<base>.<idx><ext>`. The live file is slot 0.
fn slot_path(base: &Path, idx: u32, extension: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{idx}{extension}"));
    PathBuf::from(name)
}

/// Locate an existing slot file regardless of which codec wrote it.
fn find_slot(base: &Path, idx: u32) -> Option<PathBuf> {
    KNOWN_EXTENSIONS
        .iter()
        .map(|ext| slot_path(base, idx, ext))
        .find(|candidate| candidate.is_file())
}

/// Read the store from `<base>.0<ext>` (or adopt a plain legacy `<base>`
/// file), run schema migration, and build the typed store. A missing file
/// yields a brand-new empty store.
pub fn load(base: &Path, comp: &Compressor) -> Result<Loaded> {
    let live = match find_slot(base, 0) {
        Some(path) => Some(path),
        None if base.is_file() => Some(adopt_plain_file(base, comp)?),
        None => None,
    };

    let Some(live) = live else {
        debug!("store: no file at {}, starting empty", base.display());
        let store = Store {
            meta: StoreMeta { version: DB_VERSION, ..StoreMeta::default() },
            ..Store::default()
        };
        return Ok(Loaded { store, migration: MigrationOutcome::default() });
    };

    let mut text = String::new();
    comp.open_detected(&live)?
        .read_to_string(&mut text)
        .with_context(|| format!("reading {}", live.display()))?;

    let mut root: Map<String, Value> = serde_json::from_str(&text).map_err(|err| {
        anyhow!("{}:{}:{}: {err}", live.display(), err.line(), err.column())
    })?;

    let migration = migrate::migrate(&mut root);
    let mut store: Store = serde_json::from_value(Value::Object(root))
        .with_context(|| format!("interpreting store {}", live.display()))?;
    store.dirty = migration.modified;

    debug!("store: read {} series from {} (v{})", store.len(), live.display(), store.meta.version);
    Ok(Loaded { store, migration })
}

/// A live file from before slot naming: compress it into slot 0, or just
/// rename it there if compression is unavailable or fails.
fn adopt_plain_file(base: &Path, comp: &Compressor) -> Result<PathBuf> {
    let compressed = slot_path(base, 0, comp.extension());
    if !comp.method().is_plain() {
        match comp.compress_file(base, &compressed) {
            Ok(()) => {
                debug!("store: compressed legacy file into {}", compressed.display());
                return Ok(compressed);
            }
            Err(err) => warn!("store: compressing legacy file failed: {err:#}"),
        }
    }
    let plain = slot_path(base, 0, "");
    fs::rename(base, &plain)
        .with_context(|| format!("moving {} -> {}", base.display(), plain.display()))?;
    Ok(plain)
}

/// Persist the store if dirty: serialize to a temp file, compress it,
/// rotate the backup slots, then rename the new content into the live slot.
/// Returns whether a write actually happened.
pub fn save(store: &mut Store, base: &Path, comp: &Compressor, num_backups: u32) -> Result<bool> {
    if !store.dirty {
        debug!("store: save ignored; not dirty");
        return Ok(false);
    }

    let dir = base.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let json = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    serde_json::to_writer(&json, store).context("serializing store")?;

    // compress into a second temp file; a failure here downgrades the live
    // file to uncompressed rather than failing the save
    let mut live = slot_path(base, 0, comp.extension());
    let staged = if comp.method().is_plain() {
        json.into_temp_path()
    } else {
        match compress_staged(&json, comp, dir) {
            Ok(staged) => staged,
            Err(err) => {
                warn!("store: compression failed, saving uncompressed: {err:#}");
                live = slot_path(base, 0, "");
                json.into_temp_path()
            }
        }
    };

    rotate_backups(base, num_backups);

    staged
        .persist(&live)
        .with_context(|| format!("renaming into {}", live.display()))?;

    store.dirty = false;
    debug!("store: wrote {} series (v{})", store.len(), store.meta.version);
    Ok(true)
}

fn compress_staged(
    json: &NamedTempFile,
    comp: &Compressor,
    dir: &Path,
) -> Result<tempfile::TempPath> {
    let staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?
        .into_temp_path();
    comp.compress_file(json.path(), &staged)?;
    Ok(staged)
}

/// Drop every file recorded for a slot, whichever codec wrote it. Renaming
/// alone only replaces a same-suffix file, so a codec change between runs
/// would otherwise leave stale slot files behind.
fn remove_slot_files(base: &Path, idx: u32) {
    for extension in KNOWN_EXTENSIONS {
        let candidate = slot_path(base, idx, extension);
        if candidate.is_file() {
            if let Err(err) = fs::remove_file(&candidate) {
                warn!("store: removing stale {} failed: {err}", candidate.display());
            }
        }
    }
}

/// Shift every slot up by one (oldest evicted), freeing slot 0 for the next
/// live file. Each slot keeps the filename suffix it was written with.
fn rotate_backups(base: &Path, num_backups: u32) {
    debug!("store: rotating backups");
    for idx in (0..num_backups).rev() {
        let Some(current) = find_slot(base, idx) else {
            continue;
        };
        let extension = Method::from_path(&current).extension();
        remove_slot_files(base, idx + 1);
        let shifted = slot_path(base, idx + 1, extension);
        if let Err(err) = fs::rename(&current, &shifted) {
            warn!("store: rotating {} failed: {err}", current.display());
        }
    }
}

/// Shift every backup slot down by one, restoring slot 1 into the live
/// position. Returns the number of backups remaining afterwards.
fn unrotate_backups(base: &Path, num_backups: u32) -> u32 {
    debug!("store: unrotating backups");
    let mut moved = 0u32;
    for idx in 0..num_backups {
        let Some(current) = find_slot(base, idx + 1) else {
            continue;
        };
        moved += 1;
        let extension = Method::from_path(&current).extension();
        remove_slot_files(base, idx);
        let unshifted = slot_path(base, idx, extension);
        if let Err(err) = fs::rename(&current, &unshifted) {
            warn!("store: unrotating {} failed: {err}", current.display());
        }
    }
    moved.saturating_sub(1)
}

/// Existing backup files, most recent first.
pub fn list_backups(base: &Path, num_backups: u32) -> Vec<PathBuf> {
    (1..=num_backups).filter_map(|idx| find_slot(base, idx)).collect()
}

/// What a rollback did.
pub struct RollbackOutcome {
    pub restored_from: PathBuf,
    pub remaining: u32,
    /// Changelog entries recorded in the file that was replaced.
    pub undone: Vec<ChangeEntry>,
}

/// Restore the most recent backup into the live slot. `Ok(None)` when there
/// is no backup to restore.
pub fn rollback(base: &Path, comp: &Compressor, num_backups: u32) -> Result<Option<RollbackOutcome>> {
    let Some(restored_from) = find_slot(base, 1) else {
        return Ok(None);
    };

    // the changes recorded in the live file are what this undo reverts
    let undone = match load(base, comp) {
        Ok(loaded) => loaded.store.meta().changes_log.clone(),
        Err(err) => {
            warn!("store: could not read change log before rollback: {err:#}");
            Vec::new()
        }
    };

    let remaining = unrotate_backups(base, num_backups);
    Ok(Some(RollbackOutcome { restored_from, remaining, undone }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base_in(dir: &TempDir) -> PathBuf {
        dir.path().join("series")
    }

    fn sample_meta(title: &str) -> SeriesMeta {
        SeriesMeta { title: title.to_string(), ..SeriesMeta::default() }
    }

    #[test]
    fn new_store_when_no_file_exists() {
        let dir = TempDir::new().unwrap();
        let loaded = load(&base_in(&dir), &Compressor::plain()).unwrap();
        assert!(loaded.store.is_empty());
        assert!(!loaded.store.is_dirty());
        assert_eq!(loaded.store.meta().version, DB_VERSION);
        assert!(!loaded.migration.modified);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        let comp = Compressor::plain();

        let mut store = Store::default();
        store.meta.version = DB_VERSION;
        store.add("100".into(), sample_meta("Alpha"));
        store.add("200".into(), sample_meta("Beta"));
        assert!(save(&mut store, &base, &comp, 3).unwrap());
        assert!(!store.is_dirty());

        let loaded = load(&base, &comp).unwrap();
        assert_eq!(loaded.store.len(), 2);
        assert_eq!(loaded.store.get("100").unwrap().title, "Alpha");
        assert_eq!(loaded.store.get("100").unwrap().list_index, 1);
        assert_eq!(loaded.store.get("200").unwrap().list_index, 2);
        assert_eq!(loaded.store.meta().version, DB_VERSION);
        assert_eq!(loaded.store.meta().next_list_index, 3);
        assert!(!loaded.store.is_dirty());
        assert!(!loaded.migration.modified);
    }

    #[test]
    fn save_is_a_noop_when_clean() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        let comp = Compressor::plain();

        let mut store = Store::default();
        store.add("1".into(), sample_meta("X"));
        assert!(save(&mut store, &base, &comp, 3).unwrap());
        // second save without mutation writes nothing
        assert!(!save(&mut store, &base, &comp, 3).unwrap());
        assert!(list_backups(&base, 3).is_empty());

        store.changelog_add("touched", None);
        assert!(save(&mut store, &base, &comp, 3).unwrap());
        assert_eq!(list_backups(&base, 3).len(), 1);
    }

    #[test]
    fn backup_rotation_is_bounded() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        let comp = Compressor::plain();
        let num_backups = 3;

        let mut store = Store::default();
        for round in 0..5 {
            store.insert(format!("{round}"), sample_meta(&format!("Round {round}")));
            save(&mut store, &base, &comp, num_backups).unwrap();
        }

        let backups = list_backups(&base, num_backups);
        assert_eq!(backups.len(), num_backups as usize);

        // slot 1 holds what was live before the last save: rounds 0..=3
        let previous = load_slot(&base, 1, &comp);
        assert_eq!(previous.len(), 4);
        assert!(previous.contains("3"));
        assert!(!previous.contains("4"));
    }

    #[test]
    fn rotation_drops_slots_written_by_other_codecs() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        let comp = Compressor::plain();

        let mut store = Store::default();
        store.add("1".into(), sample_meta("A"));
        save(&mut store, &base, &comp, 2).unwrap();

        // backup left behind by a run that used gzip
        fs::write(slot_path(&base, 1, ".gz"), b"ancient").unwrap();

        store.mark_dirty();
        save(&mut store, &base, &comp, 2).unwrap();
        store.mark_dirty();
        save(&mut store, &base, &comp, 2).unwrap();

        // exactly two backup slots remain and neither resolves to the relic
        let backups = list_backups(&base, 2);
        assert_eq!(backups, vec![slot_path(&base, 1, ""), slot_path(&base, 2, "")]);
        assert!(!slot_path(&base, 2, ".gz").exists());
        assert!(!slot_path(&base, 3, ".gz").exists());
    }

    #[test]
    fn rollback_replaces_a_live_file_from_another_codec() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        let comp = Compressor::plain();

        let mut store = Store::default();
        store.add("1".into(), sample_meta("First"));
        save(&mut store, &base, &comp, 5).unwrap();
        store.add("2".into(), sample_meta("Second"));
        save(&mut store, &base, &comp, 5).unwrap();

        // pretend the live file was written by a gzip-era run
        let live = find_slot(&base, 0).unwrap();
        fs::rename(&live, slot_path(&base, 0, ".gz")).unwrap();

        rollback(&base, &comp, 5).unwrap().unwrap();
        assert!(!slot_path(&base, 0, ".gz").exists());
        let restored = load(&base, &comp).unwrap().store;
        assert_eq!(restored.len(), 1);
        assert!(restored.contains("1"));
    }

    fn load_slot(base: &Path, idx: u32, comp: &Compressor) -> Store {
        let path = find_slot(base, idx).unwrap();
        let mut text = String::new();
        comp.open_detected(&path).unwrap().read_to_string(&mut text).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn plain_legacy_file_is_adopted_as_slot_zero() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        fs::write(&base, br#"{"epm:meta": {"version": 5}, "42": {"title": "Legacy"}}"#)
            .unwrap();

        let loaded = load(&base, &Compressor::plain()).unwrap();
        assert_eq!(loaded.store.get("42").unwrap().title, "Legacy");
        assert!(!base.exists(), "legacy file moved into the slot chain");
        assert!(find_slot(&base, 0).is_some());
    }

    #[test]
    fn corrupt_json_reports_position() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        fs::write(slot_path(&base, 0, ""), b"{\n  \"oops\": \n}").unwrap();

        let err = load(&base, &Compressor::plain()).unwrap_err();
        let message = format!("{err}");
        assert!(message.contains(":3:"), "no line info in: {message}");
    }

    #[test]
    fn rollback_restores_previous_content() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        let comp = Compressor::plain();

        let mut store = Store::default();
        store.add("1".into(), sample_meta("First"));
        save(&mut store, &base, &comp, 5).unwrap();

        store.add("2".into(), sample_meta("Second"));
        store.changelog_add("added Second", Some("2"));
        save(&mut store, &base, &comp, 5).unwrap();

        let outcome = rollback(&base, &comp, 5).unwrap().unwrap();
        assert_eq!(outcome.remaining, 0);
        assert_eq!(outcome.undone.len(), 1);
        assert_eq!(outcome.undone[0].0, "added Second");

        let restored = load(&base, &comp).unwrap().store;
        assert_eq!(restored.len(), 1);
        assert!(restored.contains("1"));
    }

    #[test]
    fn rollback_without_backups_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        assert!(rollback(&base, &Compressor::plain(), 5).unwrap().is_none());
    }

    #[test]
    fn remove_hands_back_the_latest_list_index() {
        let mut store = Store::default();
        store.add("a".into(), sample_meta("A"));
        let b_index = store.add("b".into(), sample_meta("B"));
        assert_eq!(b_index, 2);
        assert_eq!(store.meta().next_list_index, 3);

        store.remove("b");
        assert_eq!(store.meta().next_list_index, 2);
        // removing a non-latest entry leaves the counter alone
        store.add("c".into(), sample_meta("C"));
        store.remove("a");
        assert_eq!(store.meta().next_list_index, 3);
    }

    #[test]
    fn changelog_clear_does_not_dirty() {
        let mut store = Store::default();
        store.changelog_add("something", None);
        assert!(store.is_dirty());
        store.dirty = false;
        store.changelog_clear();
        assert!(!store.is_dirty());
        assert!(store.changelog().is_empty());
    }

    #[test]
    fn migrating_load_marks_dirty() {
        let dir = TempDir::new().unwrap();
        let base = base_in(&dir);
        fs::write(
            slot_path(&base, 0, ""),
            br#"{"7": {"title": "Old", "added": "2020-01-01 00:00:00", "seen": {}}}"#,
        )
        .unwrap();

        let loaded = load(&base, &Compressor::plain()).unwrap();
        assert!(loaded.migration.modified);
        assert!(loaded.store.is_dirty());
        assert_eq!(loaded.store.meta().version, DB_VERSION);
        assert_eq!(loaded.store.get("7").unwrap().list_index, 1);
        assert_eq!(loaded.migration.externalized.len(), 1);
    }
}
