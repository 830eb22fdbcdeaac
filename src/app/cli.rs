use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::scheduler::RequestKind;

#[derive(Debug, Parser)]
#[command(name = "quote-gate")]
#[command(about = "Rate-limited, priority-ordered fetching of market data")]
#[command(version)]
pub struct Cli {
    /// Scheduler config (JSON). Defaults to the bundled assets/configs/default.json.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Fetch one kind of data for the given symbols through the scheduler
    Fetch {
        /// technical, quote or news
        #[arg(short, long, default_value = "quote")]
        kind: RequestKind,

        /// Symbols to fetch (e.g., AAPL MSFT)
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Give up on a request still queued after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// How often to print queue status while waiting
        #[arg(long, default_value_t = 2)]
        poll_secs: u64,
    },

    /// Print the effective scheduler configuration
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fetch_command() {
        let cli = Cli::parse_from([
            "quote-gate",
            "fetch",
            "--kind",
            "news",
            "AAPL",
            "MSFT",
            "--deadline-secs",
            "30",
        ]);

        match cli.command {
            Commands::Fetch {
                kind,
                symbols,
                deadline_secs,
                poll_secs,
            } => {
                assert_eq!(kind, RequestKind::News);
                assert_eq!(symbols, vec!["AAPL", "MSFT"]);
                assert_eq!(deadline_secs, Some(30));
                assert_eq!(poll_secs, 2);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["quote-gate", "config", "--config", "custom.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.json")));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["quote-gate", "fetch", "--kind", "bonds", "AAPL"]).is_err());
    }
}
