use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "mbc",
    about = "MBC CQRS core: versioned commands, projections and bulk imports",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Import a CSV file into an in-process core and report the job
    Import(ImportArgs),
    /// Decode a partition/sort key pair
    Keys(KeysArgs),
    /// Print the default server configuration as TOML
    Config,
}

#[derive(Args)]
pub struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Override the configured bind address
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Args)]
pub struct ImportArgs {
    /// CSV file with a header row; `code` identifies each record
    pub csv: PathBuf,
    /// Import table name
    #[arg(long)]
    pub table: String,
    /// Tenant the rows belong to
    #[arg(long)]
    pub tenant: String,
    /// Logical type of the records (defaults to the upper-cased table name)
    #[arg(long)]
    pub kind: Option<String>,
    /// Columns every row must fill
    #[arg(long = "require", value_delimiter = ',')]
    pub required: Vec<String>,
    /// User recorded on the imported versions
    #[arg(long, default_value = "cli")]
    pub user: String,
}

#[derive(Args)]
pub struct KeysArgs {
    pub pk: String,
    pub sk: String,
}
