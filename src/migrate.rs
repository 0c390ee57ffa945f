//! Schema migration for the on-disk store: an ordered list of pure,
//! version-gated steps over the raw JSON tree, applied before any typed
//! record is constructed. Re-running on current data is a no-op.

use serde_json::{Map, Value};
use tracing::debug;

/// Current store schema version.
pub const DB_VERSION: u32 = 5;

/// Reserved store key holding global bookkeeping; never a series id.
pub const META_KEY: &str = "epm:meta";

const LEGACY_META_KEYS: &[&str] = &["added", "update_check", "seen", "archived"];
const ZERO_STAMP: &str = "0000-00-00 00:00:00";

/// A series payload lifted out of the main store, to be written into the
/// episode cache by the caller. Archived series keep their metadata but get
/// no cache file.
#[derive(Debug)]
pub struct Externalized {
    pub series_id: String,
    pub payload: Value,
    pub write_file: bool,
}

/// What a migration run did.
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    pub modified: bool,
    pub notes: Vec<String>,
    pub externalized: Vec<Externalized>,
}

type StepFn = fn(&mut Map<String, Value>, &mut Vec<String>) -> bool;

/// Version-gated steps in application order; a step runs when the stored
/// version is below its threshold.
const STEPS: &[(u32, StepFn)] = &[
    (1, namespace_legacy_fields),
    (1, normalize_archived),
    (2, assign_list_indexes),
    (3, merge_update_fields),
    (4, strip_nulls),
];

/// Bring `root` up to `DB_VERSION` in place. A store written by a newer
/// build is left exactly as found, never downgraded.
pub fn migrate(root: &mut Map<String, Value>) -> MigrationOutcome {
    let mut outcome = MigrationOutcome::default();

    if !root.contains_key(META_KEY) {
        // no store metadata at all; treat as version 0
        root.insert(META_KEY.to_string(), Value::Object(Map::new()));
        outcome.modified = true;
    }
    let from_version = version_of(root);

    if from_version > DB_VERSION {
        outcome.notes.push(format!(
            "Store version v{from_version} is newer than this build supports (v{DB_VERSION}); \
             leaving it untouched"
        ));
        return outcome;
    }

    for (threshold, step) in STEPS {
        if from_version < *threshold {
            outcome.modified |= step(root, &mut outcome.notes);
        }
    }

    if from_version < 5 {
        outcome.externalized = externalize_payloads(root, &mut outcome.notes);
        outcome.modified = true;
    }

    // history hygiene runs on every load, not just on version bumps
    outcome.modified |= dedup_update_history(root, &mut outcome.notes);

    if from_version != DB_VERSION {
        if let Some(meta) = root.get_mut(META_KEY).and_then(Value::as_object_mut) {
            meta.insert("version".to_string(), Value::from(DB_VERSION));
        }
        outcome.notes.push(format!("Set store version: {from_version} -> {DB_VERSION}"));
        outcome.modified = true;
    }

    debug!("migration: modified={} steps-reported={}", outcome.modified, outcome.notes.len());
    outcome
}

fn version_of(root: &Map<String, Value>) -> u32 {
    root.get(META_KEY)
        .and_then(Value::as_object)
        .and_then(|meta| meta.get("version"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}

fn series_entries_mut<'a>(
    root: &'a mut Map<String, Value>,
) -> impl Iterator<Item = (&'a String, &'a mut Map<String, Value>)> {
    root.iter_mut().filter_map(|(id, value)| {
        if id == META_KEY {
            return None;
        }
        value.as_object_mut().map(|obj| (id, obj))
    })
}

/// v1: move recognized legacy tracking keys out of the flat series object
/// into a nested metadata object under the reserved key.
fn namespace_legacy_fields(root: &mut Map<String, Value>, notes: &mut Vec<String>) -> bool {
    let mut fixed = 0usize;
    for (_, series) in series_entries_mut(root) {
        if series.contains_key(META_KEY) {
            continue;
        }
        let mut nested = Map::new();
        for key in LEGACY_META_KEYS {
            if let Some(value) = series.remove(*key) {
                nested.insert((*key).to_string(), value);
            }
        }
        series.insert(META_KEY.to_string(), Value::Object(nested));
        fixed += 1;
    }
    if fixed > 0 {
        notes.push(format!("Migrated legacy metadata; {fixed} series"));
    }
    fixed > 0
}

/// v1: an `archived` value of literal `true` becomes the latest `seen`
/// timestamp, or the zero sentinel when nothing was ever seen.
fn normalize_archived(root: &mut Map<String, Value>, notes: &mut Vec<String>) -> bool {
    let mut fixed = 0usize;
    for (_, series) in series_entries_mut(root) {
        let Some(meta) = series.get_mut(META_KEY).and_then(Value::as_object_mut) else {
            continue;
        };
        if meta.get("archived") != Some(&Value::Bool(true)) {
            continue;
        }
        let mut last_seen = ZERO_STAMP.to_string();
        if let Some(seen) = meta.get("seen").and_then(Value::as_object) {
            for stamp in seen.values().filter_map(Value::as_str) {
                if stamp > last_seen.as_str() {
                    last_seen = stamp.to_string();
                }
            }
        }
        meta.insert("archived".to_string(), Value::String(last_seen));
        fixed += 1;
    }
    if fixed > 0 {
        notes.push(format!("Fixed boolean \"archived\" value; {fixed} series"));
    }
    fixed > 0
}

/// v2: hand out list indexes in ascending `added` order and record the next
/// free index in the store metadata.
fn assign_list_indexes(root: &mut Map<String, Value>, notes: &mut Vec<String>) -> bool {
    let mut order: Vec<(String, String)> = root
        .iter()
        .filter(|(id, _)| *id != META_KEY)
        .map(|(id, series)| {
            let added = series
                .get(META_KEY)
                .and_then(Value::as_object)
                .and_then(|meta| meta.get("added"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (added, id.clone())
        })
        .collect();
    order.sort();

    let mut next_index = 1u64;
    for (_, id) in &order {
        if let Some(meta) = root
            .get_mut(id)
            .and_then(Value::as_object_mut)
            .and_then(|series| series.get_mut(META_KEY))
            .and_then(Value::as_object_mut)
        {
            meta.insert("list_index".to_string(), Value::from(next_index));
        }
        next_index += 1;
    }

    if let Some(meta) = root.get_mut(META_KEY).and_then(Value::as_object_mut) {
        meta.insert("next_list_index".to_string(), Value::from(next_index));
    }
    notes.push(format!(
        "Built list indexes for {} series; next index: {next_index}",
        order.len()
    ));
    true
}

/// v3: collapse the historical `updated` field into `update_check`, seed the
/// update history from it, and drop the redundant embedded `id`.
fn merge_update_fields(root: &mut Map<String, Value>, notes: &mut Vec<String>) -> bool {
    let mut seeded = 0usize;
    let mut changed = false;
    for (_, series) in series_entries_mut(root) {
        if series.remove("id").is_some() {
            changed = true;
        }
        // `updated` may sit flat (v0 stores) or inside the nested metadata
        let flat_update = series.remove("updated");
        let Some(meta) = series.get_mut(META_KEY).and_then(Value::as_object_mut) else {
            continue;
        };
        let last_update = meta.remove("updated").or(flat_update);
        if let Some(last_update) = last_update {
            meta.insert("update_check".to_string(), last_update.clone());
            changed = true;

            let empty_history = meta
                .get("update_history")
                .and_then(Value::as_array)
                .map_or(true, Vec::is_empty);
            if empty_history {
                meta.insert("update_history".to_string(), Value::Array(vec![last_update]));
                seeded += 1;
            }
        }
    }
    if seeded > 0 {
        notes.push(format!("Seeded empty \"update_history\" values; {seeded} series"));
    }
    changed || seeded > 0
}

/// v4: recursively drop null-valued object fields; null means absent.
fn strip_nulls(root: &mut Map<String, Value>, notes: &mut Vec<String>) -> bool {
    fn strip(value: &mut Value, removed: &mut usize) {
        match value {
            Value::Object(map) => {
                map.retain(|_, v| {
                    if v.is_null() {
                        *removed += 1;
                        false
                    } else {
                        true
                    }
                });
                for v in map.values_mut() {
                    strip(v, removed);
                }
            }
            Value::Array(items) => {
                for item in items {
                    strip(item, removed);
                }
            }
            _ => {}
        }
    }

    let mut removed = 0usize;
    for (_, series) in series_entries_mut(root) {
        for value in series.values_mut() {
            strip(value, &mut removed);
        }
        series.retain(|_, v| {
            if v.is_null() {
                removed += 1;
                false
            } else {
                true
            }
        });
    }
    if removed > 0 {
        notes.push(format!("Removed null values; {removed} fields"));
    }
    removed > 0
}

/// v5: promote each series' nested metadata to be the store entry itself and
/// lift the remaining keys (the bulk episode payload) out for the episode
/// cache. Also renames the short-lived `last-used` spelling.
fn externalize_payloads(root: &mut Map<String, Value>, notes: &mut Vec<String>) -> Vec<Externalized> {
    let ids: Vec<String> = root.keys().filter(|id| *id != META_KEY).cloned().collect();
    let mut externalized = Vec::with_capacity(ids.len());

    for series_id in ids {
        let Some(mut series) = root.remove(&series_id).and_then(to_object) else {
            continue;
        };
        let mut meta = series.remove(META_KEY).and_then(to_object).unwrap_or_default();
        if let Some(last_used) = meta.remove("last-used") {
            meta.insert("last_used".to_string(), last_used);
        }
        let write_file = !meta.contains_key("archived");
        externalized.push(Externalized {
            payload: Value::Object(series),
            write_file,
            series_id: series_id.clone(),
        });
        root.insert(series_id, Value::Object(meta));
    }

    notes.push(format!(
        "Migrating store to v{DB_VERSION} ({} series)...",
        externalized.len()
    ));
    externalized
}

/// Always-on step: sort each series' update history and drop duplicates.
fn dedup_update_history(root: &mut Map<String, Value>, notes: &mut Vec<String>) -> bool {
    let mut removed = 0usize;
    for (_, meta) in series_entries_mut(root) {
        let Some(history) = meta.get_mut("update_history").and_then(Value::as_array_mut) else {
            continue;
        };
        if history.len() < 2 {
            continue;
        }
        let mut stamps: Vec<String> = history
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        stamps.sort();
        let before = stamps.len();
        stamps.dedup();
        if stamps.len() != before || stamps.len() != history.len() {
            removed += before - stamps.len();
            *history = stamps.into_iter().map(Value::String).collect();
        }
    }
    if removed > 0 {
        notes.push(format!("Removed duplicate update-history entries; {removed} removed"));
    }
    removed > 0
}

fn to_object(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
