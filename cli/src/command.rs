//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Yijing divination service, operator CLI
#[derive(Parser, Debug)]
#[command(name = "yijing")]
#[command(version)]
pub struct Cli {
    /// Config file (default: $YIJING_CONFIG or ~/.yijing/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database (overrides [storage] database)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// JSON output for scripting
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a question and stream the reading
    Ask(AskArgs),

    /// Preview a hexagram without charging anyone
    Context(ThrowsArg),

    /// Cast six lines with yarrow stalks
    Cast,

    /// Manage accounts and wallets
    #[command(subcommand)]
    Account(AccountCommand),

    /// Browse and curate archived readings
    #[command(subcommand)]
    History(HistoryCommand),

    /// Manage reference texts
    #[command(subcommand)]
    Texts(TextsCommand),
}

#[derive(Args, Debug)]
pub struct AskArgs {
    /// Account to charge
    #[arg(long)]
    pub user: String,

    /// The question
    #[arg(long, short)]
    pub question: String,

    /// Six values in 6..=9, bottom line first; cast with yarrow stalks when omitted
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub throws: Option<Vec<i64>>,

    /// Name to address in the reading
    #[arg(long)]
    pub name: Option<String>,

    /// Client surface (web, ios, android)
    #[arg(long)]
    pub app: Option<String>,

    /// Client version, logged with --app
    #[arg(long, requires = "app")]
    pub app_version: Option<String>,

    /// Proceed on an empty wallet (the caller watched a rewarded ad)
    #[arg(long)]
    pub ad_session: bool,
}

#[derive(Args, Debug)]
pub struct ThrowsArg {
    /// Six values in 6..=9, bottom line first
    #[arg(long, value_delimiter = ',', num_args = 1.., required = true)]
    pub throws: Vec<i64>,
}

#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    /// Create an empty free account
    Create {
        user: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Show plan, balances and today's quota use
    Show { user: String },
    /// Add gold and/or silver
    Grant {
        user: String,
        #[arg(long, default_value_t = 0)]
        gold: u32,
        #[arg(long, default_value_t = 0)]
        silver: u32,
    },
    /// Start, extend or end a subscription
    Subscribe {
        user: String,
        /// Days from now; 0 ends the subscription
        #[arg(long)]
        days: u32,
    },
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommand {
    /// List readings, pinned first
    List {
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long)]
        include_expired: bool,
    },
    /// Show one reading in full
    Show { user: String, id: i64 },
    /// Keep a reading past its retention
    Pin { user: String, id: i64 },
    /// Let a pinned reading expire again
    Unpin { user: String, id: i64 },
    /// Delete a reading
    Delete { user: String, id: i64 },
    /// Delete every expired unpinned reading
    Purge,
    /// Archive readings a client saved while offline
    Import { user: String, file: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum TextsCommand {
    /// Load hexagram and line texts from a JSON file
    Import { file: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn throws_split_on_commas() {
        let cli = Cli::parse_from([
            "yijing",
            "ask",
            "--user",
            "u",
            "-q",
            "Will it rain?",
            "--throws",
            "6,7,8,9,7,8",
        ]);
        let Commands::Ask(args) = cli.command else {
            panic!("expected ask");
        };
        assert_eq!(args.throws, Some(vec![6, 7, 8, 9, 7, 8]));
        assert!(!args.ad_session);
    }

    #[test]
    fn history_import_takes_user_and_file() {
        let cli = Cli::parse_from(["yijing", "history", "import", "google:1", "offline.json"]);
        let Commands::History(HistoryCommand::Import { user, file }) = cli.command else {
            panic!("expected history import");
        };
        assert_eq!(user, "google:1");
        assert_eq!(file, PathBuf::from("offline.json"));
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::parse_from(["yijing", "history", "purge", "--json", "--database", "x.db"]);
        assert!(cli.json);
        assert_eq!(cli.database, Some(PathBuf::from("x.db")));
    }
}
