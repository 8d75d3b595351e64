use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "arbor",
    about = "Arbor: versioned object trees with typed references and replication",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log more; repeat for debug and trace output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

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
    /// Resolve a reference against a JSON state
    Resolve(ResolveArgs),
    /// Check a JSON state against a schema
    Check(CheckArgs),
    /// Print a schema's types and fingerprint
    Schema(SchemaArgs),
    /// Run replicated instances against an in-memory store
    Simulate(SimulateArgs),
}

#[derive(Args)]
pub struct ResolveArgs {
    /// Schema declared in TOML
    #[arg(long)]
    pub schema: PathBuf,
    /// Tree state as JSON
    #[arg(long)]
    pub state: PathBuf,
    /// Reference to resolve, e.g. /planets/earth/name
    #[arg(long)]
    pub path: String,
}

#[derive(Args)]
pub struct CheckArgs {
    #[arg(long)]
    pub schema: PathBuf,
    #[arg(long)]
    pub state: PathBuf,
}

#[derive(Args)]
pub struct SchemaArgs {
    #[arg(long)]
    pub schema: PathBuf,
}

#[derive(Args)]
pub struct SimulateArgs {
    #[arg(long)]
    pub schema: PathBuf,
    /// Initial state as JSON; derived from the schema when omitted
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Instance settings in TOML
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Number of instances
    #[arg(long, default_value = "2")]
    pub replicas: usize,
    /// Assignment PATH=JSON, applied round-robin across instances
    #[arg(long = "set", value_name = "PATH=JSON")]
    pub assignments: Vec<String>,
}
