use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Timestamp in the on-disk `"YYYY-MM-DD HH:MM:SS"` format.
///
/// The all-zero sentinel `"0000-00-00 00:00:00"` (used by old stores for
/// "archived at an unknown time") round-trips as `Stamp::zero()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(pub NaiveDateTime);

const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const ZERO_STAMP: &str = "0000-00-00 00:00:00";

impl Stamp {
    /// Current local time, truncated to whole seconds.
    pub fn now() -> Self {
        let now = Local::now().naive_local();
        Stamp(now.with_nanosecond(0).unwrap_or(now))
    }

    pub fn zero() -> Self {
        Stamp(NaiveDateTime::MIN)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == NaiveDateTime::MIN
    }
}

impl From<NaiveDateTime> for Stamp {
    fn from(dt: NaiveDateTime) -> Self {
        Stamp(dt)
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str(ZERO_STAMP);
        }
        write!(f, "{}", self.0.format(STAMP_FORMAT))
    }
}

impl FromStr for Stamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("0000-00-00") {
            return Ok(Stamp::zero());
        }
        // accept both the space-separated on-disk form and the 'T' variant
        NaiveDateTime::parse_from_str(s, STAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
            .map(Stamp)
            .map_err(|e| anyhow!("invalid timestamp {s:?}: {e}"))
    }
}

impl Serialize for Stamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Stamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Season part of an episode key: a regular season number, or the `"S"`
/// sentinel for specials. Specials sort after every regular season.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SeasonKey {
    Number(u32),
    Special,
}

impl fmt::Display for SeasonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeasonKey::Number(n) => write!(f, "{n}"),
            SeasonKey::Special => f.write_str("S"),
        }
    }
}

impl FromStr for SeasonKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "S" {
            return Ok(SeasonKey::Special);
        }
        s.parse::<u32>()
            .map(SeasonKey::Number)
            .map_err(|_| anyhow!("invalid season {s:?}"))
    }
}

impl Serialize for SeasonKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SeasonKey::Number(n) => serializer.serialize_u32(*n),
            SeasonKey::Special => serializer.serialize_str("S"),
        }
    }
}

impl<'de> Deserialize<'de> for SeasonKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SeasonVisitor;

        impl Visitor<'_> for SeasonVisitor {
            type Value = SeasonKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a season number or \"S\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<SeasonKey, E> {
                Ok(SeasonKey::Number(v as u32))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<SeasonKey, E> {
                Ok(SeasonKey::Number(v.max(0) as u32))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<SeasonKey, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SeasonVisitor)
    }
}

/// `"<season>:<episode>"` identifier of one episode within a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpisodeKey {
    pub season: SeasonKey,
    pub episode: u32,
}

impl EpisodeKey {
    pub fn new(season: u32, episode: u32) -> Self {
        EpisodeKey { season: SeasonKey::Number(season), episode }
    }

    pub fn special(episode: u32) -> Self {
        EpisodeKey { season: SeasonKey::Special, episode }
    }

    pub fn is_special(&self) -> bool {
        matches!(self.season, SeasonKey::Special)
    }
}

impl fmt::Display for EpisodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.season, self.episode)
    }
}

impl FromStr for EpisodeKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (season, episode) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid episode key {s:?}"))?;
        Ok(EpisodeKey {
            season: season.parse()?,
            episode: episode
                .parse()
                .map_err(|_| anyhow!("invalid episode number {episode:?}"))?,
        })
    }
}

impl Serialize for EpisodeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EpisodeKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// One episode of the full per-series payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub season: SeasonKey,
    pub episode: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub director: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writer: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guest_cast: Vec<String>,
}

impl Episode {
    pub fn key(&self) -> EpisodeKey {
        EpisodeKey { season: self.season, episode: self.episode }
    }
}

/// Full denormalized series payload as fetched from the remote catalog and
/// stored in the per-series cache file. Unrecognized catalog fields (cast,
/// crew, country, genre, ...) are carried through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub year: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub episodes: Vec<Episode>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Denormalized pointer to a single episode, kept on `SeriesMeta` for the
/// "last seen" / "next unseen" displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRef {
    pub episode: EpisodeKey,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen: Option<Stamp>,
}

/// Per-series metadata record, one per tracked series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesMeta {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub year: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_status: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "lenient")]
    pub seen: BTreeMap<EpisodeKey, Stamp>,
    #[serde(default)]
    pub list_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<Stamp>,
    /// Present iff the series is archived; the value is the archive time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<Stamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_check: Option<Stamp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "lenient")]
    pub update_history: Vec<Stamp>,
    #[serde(default)]
    pub total_episodes: u32,
    #[serde(default)]
    pub total_seasons: u32,
    #[serde(default)]
    pub unseen_episodes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_episode: Option<EpisodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_episode: Option<EpisodeRef>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty", deserialize_with = "lenient")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<Stamp>,
}

impl SeriesMeta {
    pub fn is_archived(&self) -> bool {
        self.archived.is_some()
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.active_status.as_deref(), Some("ended") | Some("canceled"))
    }

    pub fn num_seen_unseen(&self) -> (u32, u32) {
        (self.seen.len() as u32, self.unseen_episodes)
    }

    /// Append a real-update stamp to the bounded update history,
    /// dropping the oldest entries beyond `max_history`.
    pub fn add_update_stamp(&mut self, stamp: Stamp, max_history: usize) {
        self.update_history.push(stamp);
        while self.update_history.len() > max_history {
            self.update_history.remove(0);
        }
    }
}

/// One entry in the store's change log: `(message, series id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry(pub String, pub Option<String>);

/// Global store bookkeeping, kept under the reserved `"epm:meta"` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    #[serde(default, deserialize_with = "lenient")]
    pub version: u32,
    #[serde(default = "default_next_list_index", deserialize_with = "lenient_next_index")]
    pub next_list_index: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "lenient")]
    pub changes_log: Vec<ChangeEntry>,
}

fn default_next_list_index() -> u32 {
    1
}

impl Default for StoreMeta {
    fn default() -> Self {
        StoreMeta { version: 0, next_list_index: 1, changes_log: Vec::new() }
    }
}

/// Deserialize a field best-effort: malformed legacy values are coerced to
/// the field's default instead of failing the whole record.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: de::DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_next_index<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or(1))
}

// --- List index encoding ---
//
// List positions below 100 render as plain integers. Beyond that, the
// hundreds part is rendered in bijective base-26 letters so the index stays
// short to type: 155 -> "a55", 270 -> "b70".

pub fn encode_list_index(index: u32) -> String {
    if index < 100 {
        return index.to_string();
    }

    let low = index % 100;
    let mut high = index / 100;
    let mut letters = Vec::new();
    while high > 0 {
        let mut digit = high % 26;
        if digit == 0 {
            digit = 26;
        }
        letters.push((b'a' + (digit - 1) as u8) as char);
        high = (high - digit) / 26;
    }
    letters.reverse();
    format!("{}{:02}", letters.into_iter().collect::<String>(), low)
}

pub fn parse_list_index(text: &str) -> Option<u32> {
    if text.is_empty() {
        return None;
    }
    if let Ok(index) = text.parse::<u32>() {
        return Some(index);
    }

    let letters: String = text.chars().take_while(|c| c.is_ascii_lowercase()).collect();
    let digits = &text[letters.len()..];
    if letters.is_empty() || digits.len() != 2 {
        return None;
    }

    let low: u32 = digits.parse().ok()?;
    let mut high = 0u32;
    for ch in letters.chars() {
        high = high * 26 + (ch as u32 - 'a' as u32 + 1);
    }
    Some(high * 100 + low)
}
