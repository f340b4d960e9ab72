use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the Canopy binary.
#[derive(Debug, Parser)]
#[command(
    name = "canopy",
    version,
    about = "Hierarchical aggregate caches for categories, posts and attachments"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CANOPY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Warm every cache from the seed store and print aggregate statistics.
    Stats(StatsArgs),
    /// Compare cached post counts with the store and report drift.
    Audit(AuditArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct StatsArgs {
    /// Print recursive aggregates for a single category instead of the summary.
    #[arg(long, value_name = "ID")]
    pub node: Option<i64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct AuditArgs {
    /// Audit a single category; every category is audited when omitted.
    #[arg(long, value_name = "ID")]
    pub node: Option<i64>,

    /// Exit with a failure status when drift is found.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub strict: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the TOML seed document loaded into the in-memory store.
    #[arg(long = "seed", value_name = "PATH", value_hint = ValueHint::FilePath, global = true)]
    pub seed: Option<PathBuf>,

    /// Override the tracing log level (e.g. info, debug).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Force JSON formatted logs.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true",
        global = true
    )]
    pub log_json: Option<bool>,

    /// Deliver activity and file-stats events synchronously.
    #[arg(long = "sync-derived", action = clap::ArgAction::SetTrue, global = true)]
    pub sync_derived: bool,
}
