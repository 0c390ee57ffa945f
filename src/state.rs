use bitflags::bitflags;
use chrono::{Duration, NaiveDateTime};
use tracing::debug;

use crate::series::{Episode, EpisodeKey, EpisodeRef, SeasonKey, SeriesMeta, SeriesPayload, Stamp};
use crate::store::Store;

bitflags! {
    /// Derived lifecycle state of a series. `ABANDONED` is a refinement of
    /// `ARCHIVED` and shares its bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct State: u32 {
        const PLANNED   = 0x01; // added but nothing seen (yet)
        const STARTED   = 0x02; // some episodes seen
        const COMPLETED = 0x04; // all episodes seen and the series has ended
        const ARCHIVED  = 0x08; // fully watched and shelved
        const ABANDONED = 0x10 | 0x08; // archived with unseen episodes remaining

        const ACTIVE    = 0x01 | 0x02;
        const ALL       = 0x1f;
    }
}

impl State {
    /// Primary label for display.
    pub fn label(self) -> &'static str {
        if self.contains(State::ABANDONED) {
            "abandoned"
        } else if self.contains(State::ARCHIVED) {
            "archived"
        } else if self.contains(State::COMPLETED) {
            "completed"
        } else if self.contains(State::STARTED) {
            "started"
        } else {
            "planned"
        }
    }
}

/// Derive the lifecycle state from the seen/unseen counters and the
/// archived/ended flags.
pub fn series_state(meta: &SeriesMeta) -> State {
    let (num_seen, num_unseen) = meta.num_seen_unseen();

    if meta.is_archived() {
        if num_unseen > 0 {
            return State::ABANDONED;
        }
        return State::ARCHIVED;
    }

    if num_seen > 0 {
        if num_unseen == 0 && meta.is_ended() {
            return State::COMPLETED;
        }
        return State::STARTED;
    }

    State::PLANNED
}

/// Staleness-policy knobs; see `should_update`.
#[derive(Debug, Clone)]
pub struct UpdateTuning {
    /// Upper bound on the expected update interval, so a series with long
    /// historical gaps doesn't starve future checks.
    pub interval_cap: Duration,
}

impl Default for UpdateTuning {
    fn default() -> Self {
        UpdateTuning { interval_cap: Duration::days(7) }
    }
}

/// Decide whether a refresh cycle should bother contacting the remote
/// catalog for this series. Pure function of `meta` and the clock.
pub fn should_update(meta: &SeriesMeta, now: NaiveDateTime, tuning: &UpdateTuning) -> bool {
    // never checked -> always refresh once
    let Some(last_check) = meta.update_check else {
        return true;
    };

    // no further business with archived or completed series
    if series_state(meta).intersects(State::ARCHIVED | State::COMPLETED) {
        return false;
    }

    // ended/canceled: assume all episode data is already captured
    if meta.is_ended() {
        return false;
    }

    if meta.update_history.is_empty() {
        debug!("{}: no update history -> update", meta.title);
        return true;
    }

    let interval = if meta.update_history.len() >= 2 {
        // mean gap between consecutive historical updates
        let mut sum = Duration::zero();
        for pair in meta.update_history.windows(2) {
            sum = sum + (pair[1].0 - pair[0].0);
        }
        sum / (meta.update_history.len() as i32 - 1)
    } else {
        // only one real update known: age of that update
        let last_update = meta.update_history[meta.update_history.len() - 1];
        now - last_update.0
    };
    let interval = interval.min(tuning.interval_cap).max(Duration::zero());

    let next_check = last_check.0 + interval;
    debug!(
        "{}: interval {}h, next check {}",
        meta.title,
        interval.num_hours(),
        Stamp(next_check)
    );
    now > next_check
}

/// Split the episode list into seen and unseen, optionally restricting the
/// unseen side to episodes already aired before `before`.
pub fn seen_unseen<'a>(
    payload: &'a SeriesPayload,
    meta: &SeriesMeta,
    before: Option<NaiveDateTime>,
) -> (Vec<&'a Episode>, Vec<&'a Episode>) {
    let mut seen = Vec::new();
    let mut unseen = Vec::new();

    for ep in &payload.episodes {
        if meta.seen.contains_key(&ep.key()) {
            seen.push(ep);
            continue;
        }
        match (ep.date, before) {
            (Some(date), Some(before)) if date.and_hms_opt(0, 0, 0).unwrap_or_default() > before => {}
            (None, Some(_)) => {} // filtering by date but the episode has none
            _ => unseen.push(ep),
        }
    }

    (seen, unseen)
}

/// Highest regular `(season, episode)` pair marked seen; specials never
/// advance the main sequence.
fn highest_seen(meta: &SeriesMeta) -> Option<(u32, u32, Stamp)> {
    let mut highest: Option<(u32, u32, Stamp)> = None;
    for (key, stamp) in &meta.seen {
        let SeasonKey::Number(season) = key.season else {
            continue;
        };
        if highest.map_or(true, |(s, e, _)| (season, key.episode) > (s, e)) {
            highest = Some((season, key.episode, *stamp));
        }
    }
    highest
}

/// The most recently watched episode (by position) and when it was seen.
pub fn last_seen_episode<'a>(
    payload: &'a SeriesPayload,
    meta: &SeriesMeta,
) -> Option<(&'a Episode, Stamp)> {
    let (season, episode, stamp) = highest_seen(meta)?;
    let key = EpisodeKey::new(season, episode);
    payload
        .episodes
        .iter()
        .find(|ep| ep.key() == key)
        .map(|ep| (ep, stamp))
}

/// The episode immediately following the highest seen one (same season,
/// episode + 1, or first of the next season), or the very first episode if
/// nothing is seen yet. `None` when no contiguous next episode exists.
pub fn next_unseen_episode<'a>(
    payload: &'a SeriesPayload,
    meta: &SeriesMeta,
) -> Option<&'a Episode> {
    if payload.episodes.is_empty() {
        return None;
    }

    let Some((season, episode, _)) = highest_seen(meta) else {
        return payload.episodes.first();
    };

    payload.episodes.iter().find(|ep| {
        let SeasonKey::Number(ep_season) = ep.season else {
            return false;
        };
        (ep_season == season && ep.episode == episode + 1)
            || (ep_season == season + 1 && ep.episode == 1)
    })
}

/// Recompute every derived `SeriesMeta` field from the full payload:
/// identity fields, pruned seen set, totals, unseen count and the
/// last/next episode pointers. Touches `last_used`.
pub fn update_meta(meta: &mut SeriesMeta, payload: &SeriesPayload, now: Stamp) {
    meta.title = payload.title.clone();
    if payload.year.is_some() {
        meta.year = payload.year.clone();
    }
    if payload.imdb_id.is_some() {
        meta.imdb_id = payload.imdb_id.clone();
    }
    if payload.active_status.is_some() {
        meta.active_status = payload.active_status.clone();
    }

    // drop seen marks whose episode no longer exists in the catalog data
    let all_keys: std::collections::BTreeSet<EpisodeKey> =
        payload.episodes.iter().map(Episode::key).collect();
    meta.seen.retain(|key, _| all_keys.contains(key));

    if payload.episodes.is_empty() {
        debug!("no episodes: {}", meta.title);
    }
    meta.total_episodes = payload.episodes.len() as u32;
    meta.total_seasons = payload
        .episodes
        .iter()
        .map(|ep| ep.season)
        .collect::<std::collections::BTreeSet<_>>()
        .len() as u32;
    let (_, unseen) = seen_unseen(payload, meta, None);
    meta.unseen_episodes = unseen.len() as u32;

    meta.last_episode = last_seen_episode(payload, meta).map(|(ep, stamp)| EpisodeRef {
        episode: ep.key(),
        title: ep.title.clone(),
        date: ep.date,
        seen: Some(stamp),
    });

    meta.next_episode = next_unseen_episode(payload, meta).map(|ep| EpisodeRef {
        episode: ep.key(),
        title: ep.title.clone(),
        date: ep.date,
        seen: None,
    });

    meta.last_used = Some(now);
}

/// Filters for `indexed_series`.
#[derive(Debug, Default, Clone)]
pub struct ListFilter<'a> {
    pub index: Option<u32>,
    pub state: Option<State>,
    pub tags: Option<&'a [String]>,
}

/// A predictably sorted (title, then year) view over the store, optionally
/// filtered; yields `(list_index, series_id)` pairs.
pub fn indexed_series(store: &Store, filter: &ListFilter) -> Vec<(u32, String)> {
    let mut rows: Vec<(&String, &SeriesMeta)> = store
        .iter()
        .filter(|(_, meta)| {
            if let Some(index) = filter.index {
                if meta.list_index != index {
                    return false;
                }
            }
            if let Some(state) = filter.state {
                if !series_state(meta).intersects(state) {
                    return false;
                }
            }
            if let Some(tags) = filter.tags {
                if !tags.iter().any(|tag| meta.tags.contains(tag)) {
                    return false;
                }
            }
            true
        })
        .collect();

    rows.sort_by(|(_, a), (_, b)| {
        (a.title.to_lowercase(), &a.year).cmp(&(b.title.to_lowercase(), &b.year))
    });

    rows.into_iter().map(|(id, meta)| (meta.list_index, id.clone())).collect()
}

/// Result of a single-series lookup; multiple matches are candidates for
/// the caller to disambiguate, not an error.
#[derive(Debug, PartialEq)]
pub enum FindResult {
    Found { index: u32, series_id: String },
    Ambiguous(Vec<(u32, String)>),
    NotFound,
}

/// Look up one series by list index (plain or letter-prefixed), IMDb-style
/// id (`tt...`), or case-insensitive title substring.
pub fn find_single_series(store: &Store, needle: &str) -> FindResult {
    if needle.is_empty() {
        return FindResult::NotFound;
    }

    let mut find_index = None;
    let mut find_imdb = None;
    let mut find_title = None;
    if let Some(index) = crate::series::parse_list_index(needle) {
        find_index = Some(index);
    } else if needle.starts_with("tt") {
        find_imdb = Some(needle);
    } else {
        find_title = Some(needle.to_lowercase());
    }

    let mut found: Vec<(u32, String)> = store
        .iter()
        .filter(|(_, meta)| {
            if let Some(index) = find_index {
                if meta.list_index != index {
                    return false;
                }
            }
            if let Some(imdb) = find_imdb {
                if meta.imdb_id.as_deref() != Some(imdb) {
                    return false;
                }
            }
            if let Some(title) = &find_title {
                if !meta.title.to_lowercase().contains(title.as_str()) {
                    return false;
                }
            }
            true
        })
        .map(|(id, meta)| (meta.list_index, id.clone()))
        .collect();

    match found.len() {
        0 => FindResult::NotFound,
        1 => {
            let (index, series_id) = found.remove(0);
            FindResult::Found { index, series_id }
        }
        _ => FindResult::Ambiguous(found),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(s: &str) -> Stamp {
        s.parse().unwrap()
    }

    fn episode(season: u32, episode: u32, date: &str) -> Episode {
        Episode {
            season: SeasonKey::Number(season),
            episode,
            title: format!("Episode {season}x{episode}"),
            date: date.parse().ok(),
            runtime: None,
            director: Vec::new(),
            writer: Vec::new(),
            guest_cast: Vec::new(),
        }
    }

    fn payload(episodes: Vec<Episode>) -> SeriesPayload {
        SeriesPayload { title: "Test Show".into(), episodes, ..Default::default() }
    }

    fn meta_with_seen(keys: &[(u32, u32)], unseen: u32) -> SeriesMeta {
        let mut meta = SeriesMeta { title: "Test Show".into(), ..Default::default() };
        for (s, e) in keys {
            meta.seen.insert(EpisodeKey::new(*s, *e), stamp("2023-01-01 20:00:00"));
        }
        meta.unseen_episodes = unseen;
        meta
    }

    #[test]
    fn state_derivation_is_total() {
        for archived in [false, true] {
            for num_seen in [0u32, 2] {
                for num_unseen in [0u32, 3] {
                    for status in [None, Some("ended".to_string())] {
                        let mut meta = meta_with_seen(
                            &(0..num_seen).map(|e| (1, e + 1)).collect::<Vec<_>>(),
                            num_unseen,
                        );
                        meta.active_status = status;
                        if archived {
                            meta.archived = Some(stamp("2023-02-01 00:00:00"));
                        }
                        let state = series_state(&meta);
                        let primary: Vec<State> = [
                            State::ABANDONED,
                            State::ARCHIVED,
                            State::COMPLETED,
                            State::STARTED,
                            State::PLANNED,
                        ]
                        .into_iter()
                        .filter(|s| state == *s)
                        .collect();
                        assert_eq!(primary.len(), 1, "state {state:?} not exactly one label");
                        if state.contains(State::ABANDONED) {
                            assert!(state.contains(State::ARCHIVED));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn lifecycle_scenario() {
        // empty store, add a 3-episode series aired in the past
        let eps = vec![
            episode(1, 1, "2020-01-01"),
            episode(1, 2, "2020-01-08"),
            episode(1, 3, "2020-01-15"),
        ];
        let payload = payload(eps);
        let mut meta = SeriesMeta { title: "S1".into(), ..Default::default() };
        update_meta(&mut meta, &payload, stamp("2023-01-01 00:00:00"));
        assert_eq!(series_state(&meta), State::PLANNED);

        meta.seen.insert(EpisodeKey::new(1, 1), stamp("2023-01-02 21:00:00"));
        update_meta(&mut meta, &payload, stamp("2023-01-02 21:00:00"));
        assert_eq!(series_state(&meta), State::STARTED);

        meta.seen.insert(EpisodeKey::new(1, 2), stamp("2023-01-03 21:00:00"));
        meta.seen.insert(EpisodeKey::new(1, 3), stamp("2023-01-04 21:00:00"));
        meta.active_status = Some("ended".into());
        update_meta(&mut meta, &payload, stamp("2023-01-04 21:00:00"));
        assert_eq!(series_state(&meta), State::COMPLETED);

        meta.archived = Some(stamp("2023-01-05 00:00:00"));
        assert_eq!(series_state(&meta), State::ARCHIVED);
    }

    #[test]
    fn abandoned_when_archived_with_unseen() {
        let mut meta = meta_with_seen(&[(1, 1)], 2);
        meta.archived = Some(stamp("2023-01-01 00:00:00"));
        assert_eq!(series_state(&meta), State::ABANDONED);
        assert!(series_state(&meta).contains(State::ARCHIVED));

        // final definition: seen count is not required
        let mut meta = meta_with_seen(&[], 2);
        meta.archived = Some(stamp("2023-01-01 00:00:00"));
        assert_eq!(series_state(&meta), State::ABANDONED);
    }

    #[test]
    fn next_and_last_episode() {
        let payload = payload(vec![
            episode(1, 1, "2020-01-01"),
            episode(1, 2, "2020-01-08"),
            episode(1, 3, "2020-01-15"),
            episode(2, 1, "2021-01-01"),
        ]);

        let mut meta = meta_with_seen(&[], 4);
        assert_eq!(next_unseen_episode(&payload, &meta).unwrap().key(), EpisodeKey::new(1, 1));
        assert!(last_seen_episode(&payload, &meta).is_none());

        meta.seen.insert(EpisodeKey::new(1, 1), stamp("2023-01-01 20:00:00"));
        meta.seen.insert(EpisodeKey::new(1, 2), stamp("2023-01-02 20:00:00"));
        assert_eq!(next_unseen_episode(&payload, &meta).unwrap().key(), EpisodeKey::new(1, 3));
        let (last, seen_at) = last_seen_episode(&payload, &meta).unwrap();
        assert_eq!(last.key(), EpisodeKey::new(1, 2));
        assert_eq!(seen_at, stamp("2023-01-02 20:00:00"));

        // season rollover
        meta.seen.insert(EpisodeKey::new(1, 3), stamp("2023-01-03 20:00:00"));
        assert_eq!(next_unseen_episode(&payload, &meta).unwrap().key(), EpisodeKey::new(2, 1));

        // gap: nothing follows 2:1
        meta.seen.insert(EpisodeKey::new(2, 1), stamp("2023-01-04 20:00:00"));
        assert!(next_unseen_episode(&payload, &meta).is_none());
    }

    #[test]
    fn specials_do_not_advance_the_sequence() {
        let mut payload = payload(vec![episode(1, 1, "2020-01-01"), episode(1, 2, "2020-01-08")]);
        payload.episodes.push(Episode {
            season: SeasonKey::Special,
            episode: 1,
            title: "Christmas special".into(),
            date: None,
            runtime: None,
            director: Vec::new(),
            writer: Vec::new(),
            guest_cast: Vec::new(),
        });

        let mut meta = meta_with_seen(&[], 3);
        meta.seen.insert(EpisodeKey::special(1), stamp("2023-01-01 20:00:00"));
        // only a special is seen: the "next" episode is still the first one
        assert_eq!(next_unseen_episode(&payload, &meta).unwrap().key(), EpisodeKey::new(1, 1));
        assert!(last_seen_episode(&payload, &meta).is_none());
    }

    #[test]
    fn update_meta_prunes_vanished_seen_keys() {
        let payload = payload(vec![episode(1, 1, "2020-01-01"), episode(1, 2, "2020-01-08")]);
        let mut meta = meta_with_seen(&[(1, 1), (1, 9)], 0);
        update_meta(&mut meta, &payload, stamp("2023-01-01 00:00:00"));
        assert!(meta.seen.contains_key(&EpisodeKey::new(1, 1)));
        assert!(!meta.seen.contains_key(&EpisodeKey::new(1, 9)));
        assert_eq!(meta.total_episodes, 2);
        assert_eq!(meta.total_seasons, 1);
        assert_eq!(meta.unseen_episodes, 1);
    }

    #[test]
    fn seen_unseen_respects_airing_cutoff() {
        let payload = payload(vec![
            episode(1, 1, "2020-01-01"),
            episode(1, 2, "2030-01-01"), // future
        ]);
        let meta = meta_with_seen(&[], 0);
        let before = stamp("2023-01-01 00:00:00").0;
        let (seen, unseen) = seen_unseen(&payload, &meta, Some(before));
        assert!(seen.is_empty());
        assert_eq!(unseen.len(), 1);
        assert_eq!(unseen[0].key(), EpisodeKey::new(1, 1));
    }

    #[test]
    fn should_update_policy() {
        let tuning = UpdateTuning::default();
        let now = stamp("2023-06-01 12:00:00").0;

        // never checked -> true
        let meta = meta_with_seen(&[], 3);
        assert!(should_update(&meta, now, &tuning));

        // archived -> false, regardless of timestamps
        let mut archived = meta_with_seen(&[(1, 1)], 0);
        archived.update_check = Some(stamp("2020-01-01 00:00:00"));
        archived.archived = Some(stamp("2020-01-01 00:00:00"));
        assert!(!should_update(&archived, now, &tuning));

        // completed -> false
        let mut done = meta_with_seen(&[(1, 1)], 0);
        done.update_check = Some(stamp("2020-01-01 00:00:00"));
        done.active_status = Some("ended".into());
        assert!(!should_update(&done, now, &tuning));

        // ended (even when not all seen) -> false
        let mut ended = meta_with_seen(&[(1, 1)], 2);
        ended.update_check = Some(stamp("2020-01-01 00:00:00"));
        ended.active_status = Some("canceled".into());
        assert!(!should_update(&ended, now, &tuning));

        // checked but no real update ever reported -> true
        let mut unknown = meta_with_seen(&[(1, 1)], 2);
        unknown.update_check = Some(stamp("2023-05-31 00:00:00"));
        assert!(should_update(&unknown, now, &tuning));
    }

    #[test]
    fn should_update_uses_mean_history_gap() {
        let tuning = UpdateTuning::default();
        // weekly-ish updates, mean gap = 1 day (capped at 7, so no cap)
        let mut meta = meta_with_seen(&[(1, 1)], 2);
        meta.update_history = vec![
            stamp("2023-05-01 00:00:00"),
            stamp("2023-05-02 00:00:00"),
            stamp("2023-05-03 00:00:00"),
        ];
        meta.update_check = Some(stamp("2023-05-03 00:00:00"));

        // immediately after the check: no update
        assert!(!should_update(&meta, stamp("2023-05-03 06:00:00").0, &tuning));
        // beyond the mean gap: update again
        assert!(should_update(&meta, stamp("2023-05-04 06:00:00").0, &tuning));
    }

    #[test]
    fn should_update_caps_long_intervals() {
        let tuning = UpdateTuning::default();
        // a show on hiatus: gaps of ~a year would starve checks without a cap
        let mut meta = meta_with_seen(&[(1, 1)], 2);
        meta.update_history = vec![
            stamp("2021-01-01 00:00:00"),
            stamp("2022-01-01 00:00:00"),
        ];
        meta.update_check = Some(stamp("2023-01-01 00:00:00"));
        // 8 days after the last check > 7-day cap
        assert!(should_update(&meta, stamp("2023-01-09 00:00:00").0, &tuning));
        // 6 days after: still within the capped interval
        assert!(!should_update(&meta, stamp("2023-01-07 00:00:00").0, &tuning));
    }

    #[test]
    fn staleness_monotonicity() {
        let tuning = UpdateTuning::default();
        let mut meta = meta_with_seen(&[(1, 1)], 2);
        meta.update_history = vec![stamp("2023-05-01 00:00:00")];
        meta.update_check = Some(stamp("2023-06-01 12:00:00"));

        // false right after update_check is "now"
        assert!(!should_update(&meta, stamp("2023-06-01 12:00:00").0, &tuning));
        // eventually true once the capped interval has elapsed
        assert!(should_update(&meta, stamp("2023-06-30 12:00:00").0, &tuning));
    }

    #[test]
    fn find_and_index_views() {
        let mut store = Store::default();
        let mut a = meta_with_seen(&[], 0);
        a.title = "Breaking Sad".into();
        a.imdb_id = Some("tt0903747".into());
        a.list_index = 1;
        let mut b = meta_with_seen(&[(1, 1)], 2);
        b.title = "Bad Doctor".into();
        b.list_index = 2;
        b.tags.insert("drama".to_string());
        store.insert("100".into(), a);
        store.insert("200".into(), b);

        // sorted by title
        let rows = indexed_series(&store, &ListFilter::default());
        assert_eq!(rows, vec![(2, "200".to_string()), (1, "100".to_string())]);

        // state filter
        let rows = indexed_series(
            &store,
            &ListFilter { state: Some(State::STARTED), ..Default::default() },
        );
        assert_eq!(rows, vec![(2, "200".to_string())]);

        // tag filter
        let tags = vec!["drama".to_string()];
        let rows =
            indexed_series(&store, &ListFilter { tags: Some(&tags), ..Default::default() });
        assert_eq!(rows, vec![(2, "200".to_string())]);

        assert_eq!(
            find_single_series(&store, "1"),
            FindResult::Found { index: 1, series_id: "100".into() }
        );
        assert_eq!(
            find_single_series(&store, "tt0903747"),
            FindResult::Found { index: 1, series_id: "100".into() }
        );
        assert_eq!(
            find_single_series(&store, "doctor"),
            FindResult::Found { index: 2, series_id: "200".into() }
        );
        assert!(matches!(find_single_series(&store, "b"), FindResult::Ambiguous(c) if c.len() == 2));
        assert_eq!(find_single_series(&store, "nope"), FindResult::NotFound);
        assert_eq!(find_single_series(&store, ""), FindResult::NotFound);
    }
}
