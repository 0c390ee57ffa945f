mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use episodic::{
    encode_list_index, find_single_series, indexed_series, series_state, EpisodeKey, FindResult,
    ListFilter, SeriesPayload, State, Tracker, TrackerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TrackerConfig::load()?;
    let mut tracker = Tracker::load(config, None).await?;

    match cli.command {
        Commands::List { state, tag } => {
            let state = match state.as_deref() {
                Some(name) => match cli::parse_state(name) {
                    Some(state) => Some(state),
                    None => {
                        eprintln!("unknown state: {name}");
                        std::process::exit(2);
                    }
                },
                None => Some(State::ACTIVE),
            };
            let filter = ListFilter {
                state,
                tags: (!tag.is_empty()).then_some(tag.as_slice()),
                ..ListFilter::default()
            };
            for (index, series_id) in indexed_series(tracker.store(), &filter) {
                let Some(meta) = tracker.store().get(&series_id) else {
                    continue;
                };
                let (seen, _) = meta.num_seen_unseen();
                println!(
                    "{:>4}  {}  [{}]  {}/{} seen",
                    encode_list_index(index),
                    meta.title,
                    series_state(meta).label(),
                    seen,
                    meta.total_episodes
                );
                if let Some(next) = &meta.next_episode {
                    println!("      next: {} {}", next.episode, next.title);
                }
            }
        }

        Commands::Add { series_id, title } => {
            let payload = SeriesPayload {
                title: title.unwrap_or_else(|| series_id.clone()),
                ..SeriesPayload::default()
            };
            let index = tracker.add(series_id.clone(), payload).await?;
            let title = tracker.store().get(&series_id).map(|m| m.title.clone());
            let title = title.unwrap_or_default();
            tracker
                .store_mut()
                .changelog_add(format!("Added \"{title}\""), Some(&series_id));
            println!("added \"{title}\" as {}", encode_list_index(index));
        }

        Commands::Seen { series, episodes } => {
            if let Some(series_id) = resolve(&tracker, &series) {
                let keys = parse_episode_keys(&episodes);
                let marked = tracker.mark_seen(&series_id, &keys).await?;
                let title = title_of(&tracker, &series_id);
                tracker.store_mut().changelog_add(
                    format!("Marked {marked} episode(s) of \"{title}\" seen"),
                    Some(&series_id),
                );
                println!("marked {marked} episode(s) of \"{title}\" seen");
            }
        }

        Commands::Unseen { series, episodes } => {
            if let Some(series_id) = resolve(&tracker, &series) {
                let keys = parse_episode_keys(&episodes);
                let cleared = tracker.mark_unseen(&series_id, &keys).await?;
                let title = title_of(&tracker, &series_id);
                tracker.store_mut().changelog_add(
                    format!("Unmarked {cleared} episode(s) of \"{title}\""),
                    Some(&series_id),
                );
                println!("unmarked {cleared} episode(s) of \"{title}\"");
            }
        }

        Commands::Archive { series } => {
            if let Some(series_id) = resolve(&tracker, &series) {
                let title = title_of(&tracker, &series_id);
                if tracker.archive(&series_id).await? {
                    tracker
                        .store_mut()
                        .changelog_add(format!("Archived \"{title}\""), Some(&series_id));
                    println!("archived \"{title}\"");
                } else {
                    println!("\"{title}\" is already archived");
                }
            }
        }

        Commands::Restore { series } => {
            if let Some(series_id) = resolve(&tracker, &series) {
                let title = title_of(&tracker, &series_id);
                if tracker.restore(&series_id)? {
                    tracker
                        .store_mut()
                        .changelog_add(format!("Restored \"{title}\""), Some(&series_id));
                    println!("restored \"{title}\"");
                } else {
                    println!("\"{title}\" is not archived");
                }
            }
        }

        Commands::Remove { series } => {
            if let Some(series_id) = resolve(&tracker, &series) {
                if let Some(removed) = tracker.remove(&series_id).await? {
                    tracker
                        .store_mut()
                        .changelog_add(format!("Removed \"{}\"", removed.title), Some(&series_id));
                    println!("removed \"{}\"", removed.title);
                }
            }
        }

        Commands::Tag { series, tag } => {
            if let Some(series_id) = resolve(&tracker, &series) {
                let title = title_of(&tracker, &series_id);
                if tracker.tag(&series_id, &tag)? {
                    tracker.store_mut().changelog_add(
                        format!("Tagged \"{title}\" as \"{tag}\""),
                        Some(&series_id),
                    );
                    println!("tagged \"{title}\" as \"{tag}\"");
                } else {
                    println!("\"{title}\" is already tagged \"{tag}\"");
                }
            }
        }

        Commands::Untag { series, tag } => {
            if let Some(series_id) = resolve(&tracker, &series) {
                let title = title_of(&tracker, &series_id);
                if tracker.untag(&series_id, &tag)? {
                    tracker.store_mut().changelog_add(
                        format!("Untagged \"{title}\": \"{tag}\""),
                        Some(&series_id),
                    );
                    println!("untagged \"{title}\": \"{tag}\"");
                } else {
                    println!("\"{title}\" is not tagged \"{tag}\"");
                }
            }
        }

        Commands::Rate { series, rating, comment } => {
            if let Some(series_id) = resolve(&tracker, &series) {
                let title = title_of(&tracker, &series_id);
                tracker.rate(&series_id, rating, comment)?;
                tracker
                    .store_mut()
                    .changelog_add(format!("Rated \"{title}\": {rating}"), Some(&series_id));
                println!("rated \"{title}\": {rating}");
            }
        }

        Commands::Refresh { force } => {
            match tracker.refresh(force, |done, total| eprint!("\r{done}/{total}")).await {
                Ok(outcome) => {
                    if outcome.fetched > 0 {
                        eprintln!();
                    }
                    println!(
                        "{} series checked, {} updated",
                        outcome.checked, outcome.fetched
                    );
                    for (series_id, err) in &outcome.failures {
                        eprintln!("series {series_id}: {err:#}");
                    }
                }
                Err(err) => {
                    eprintln!("refresh unavailable: {err:#}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Undo => match tracker.rollback().await? {
            Some(outcome) => {
                println!(
                    "restored {} ({} backups remaining)",
                    outcome.restored_from.display(),
                    outcome.remaining
                );
                for entry in &outcome.undone {
                    println!("undid: {}", entry.0);
                }
            }
            None => println!("no backup to restore"),
        },

        Commands::Backups => {
            let backups = tracker.backups();
            if backups.is_empty() {
                println!("no backups");
            }
            for path in backups {
                println!("{}", path.display());
            }
        }
    }

    tracker.save().await?;
    Ok(())
}

/// Resolve a user-supplied series reference, reporting ambiguity or a miss
/// to the user instead of failing.
fn resolve(tracker: &Tracker, needle: &str) -> Option<String> {
    match find_single_series(tracker.store(), needle) {
        FindResult::Found { series_id, .. } => Some(series_id),
        FindResult::Ambiguous(candidates) => {
            eprintln!("\"{needle}\" matches {} series:", candidates.len());
            for (index, series_id) in candidates {
                let title = title_of(tracker, &series_id);
                eprintln!("  {:>4}  {title}", encode_list_index(index));
            }
            None
        }
        FindResult::NotFound => {
            eprintln!("no series matches \"{needle}\"");
            None
        }
    }
}

fn title_of(tracker: &Tracker, series_id: &str) -> String {
    tracker.store().get(series_id).map(|meta| meta.title.clone()).unwrap_or_default()
}

fn parse_episode_keys(texts: &[String]) -> Vec<EpisodeKey> {
    let mut keys = Vec::new();
    for text in texts {
        match text.parse() {
            Ok(key) => keys.push(key),
            Err(_) => eprintln!("skipping unparsable episode \"{text}\""),
        }
    }
    keys
}
