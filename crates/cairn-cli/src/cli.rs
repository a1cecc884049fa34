use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cairn",
    about = "Cairn: in-memory tables of JSON documents with snapshot reads",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path of the TOML configuration file
    #[arg(short, long, global = true, default_value = "cairn.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load every source, keep them in sync and serve the database over HTTP
    Serve(ServeArgs),
    /// Load every source once and report what was loaded
    Check(CheckArgs),
    /// Load every source once and print the database as JSON
    Dump(DumpArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Overrides `server.bind_addr`
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Do not log individual changes
    #[arg(long)]
    pub quiet_changes: bool,
}

#[derive(Args)]
pub struct CheckArgs {}

#[derive(Args)]
pub struct DumpArgs {
    /// Only dump this table
    #[arg(short, long)]
    pub table: Option<String>,
    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Only dump documents found through this index of `--table`
    #[arg(long, requires_all = ["table", "value"])]
    pub index: Option<String>,
    /// Index key to look up, as JSON or a bare string
    #[arg(long, requires = "index")]
    pub value: Option<String>,
}
