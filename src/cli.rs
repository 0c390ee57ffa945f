use clap::{Parser, Subcommand};

use episodic::State;

/// Terminal tracker for TV series viewing progress
#[derive(Parser)]
#[command(name = "episodic")]
#[command(about = "Track which episodes you have seen, across all your series", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List tracked series
    List {
        /// Only series in this state (planned, started, completed,
        /// archived, abandoned, active, all)
        #[arg(short, long)]
        state: Option<String>,
        /// Only series carrying one of these tags
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// Start tracking a series by its catalog id
    Add {
        series_id: String,
        /// Title to record until the first refresh fills in details
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Mark episodes as seen, e.g. `1:3` or `S:1` for specials
    Seen {
        /// Series to update: list index, IMDb id or title substring
        series: String,
        episodes: Vec<String>,
    },
    /// Unmark previously seen episodes
    Unseen { series: String, episodes: Vec<String> },
    /// Shelve a series; its cached episode data is dropped
    Archive { series: String },
    /// Bring a series back from the archive
    Restore { series: String },
    /// Stop tracking a series entirely
    Remove { series: String },
    /// Attach a tag to a series
    Tag { series: String, tag: String },
    /// Remove a tag from a series
    Untag { series: String, tag: String },
    /// Rate an archived series on a 1-10 scale
    Rate {
        series: String,
        #[arg(value_parser = clap::value_parser!(u32).range(1..=10))]
        rating: u32,
        /// Free-form note stored alongside the rating
        #[arg(short, long)]
        comment: Option<String>,
    },
    /// Refresh episode data from the remote catalog
    Refresh {
        /// Re-fetch every non-archived series regardless of staleness
        #[arg(short, long)]
        force: bool,
    },
    /// Restore the most recent backup, undoing the last saved changes
    Undo,
    /// List existing store backups, most recent first
    Backups,
}

/// Map a user-supplied state name to the flag set used for filtering.
pub fn parse_state(name: &str) -> Option<State> {
    match name.to_lowercase().as_str() {
        "planned" => Some(State::PLANNED),
        "started" => Some(State::STARTED),
        "completed" => Some(State::COMPLETED),
        "archived" => Some(State::ARCHIVED),
        "abandoned" => Some(State::ABANDONED),
        "active" => Some(State::ACTIVE),
        "all" => Some(State::ALL),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        assert_eq!(parse_state("active"), Some(State::ACTIVE));
        assert_eq!(parse_state("ARCHIVED"), Some(State::ARCHIVED));
        assert_eq!(parse_state("bogus"), None);
    }

    #[test]
    fn command_line_parses() {
        let cli = Cli::try_parse_from(["episodic", "seen", "lost", "1:1", "1:2"]).unwrap();
        match cli.command {
            Commands::Seen { series, episodes } => {
                assert_eq!(series, "lost");
                assert_eq!(episodes, vec!["1:1", "1:2"]);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn rating_range_is_enforced() {
        let cli = Cli::try_parse_from(["episodic", "rate", "lost", "8"]).unwrap();
        match cli.command {
            Commands::Rate { rating, comment, .. } => {
                assert_eq!(rating, 8);
                assert!(comment.is_none());
            }
            _ => panic!("wrong command"),
        }
        assert!(Cli::try_parse_from(["episodic", "rate", "lost", "11"]).is_err());
        assert!(Cli::try_parse_from(["episodic", "rate", "lost", "0"]).is_err());
    }
}
