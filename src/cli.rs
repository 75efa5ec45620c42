use clap::{Parser, Subcommand};
use std::path::PathBuf;
use timeseal::digest::HashAlgorithm;

#[derive(Parser, Debug)]
#[command(name = "timeseal")]
#[command(about = "Batch RFC 3161 timestamping for PDF documents", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to $TIMESEAL_CONFIG or config/timeseal.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Timestamp one or more PDF documents
    Seal(SealArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct SealArgs {
    /// Time-Stamp Authority URL
    #[arg(long)]
    pub tsa_url: Option<String>,

    /// Suffix appended to each output file stem
    #[arg(long)]
    pub suffix: Option<String>,

    /// Keep the original document structure instead of rebuilding it
    #[arg(long)]
    pub no_repair: bool,

    /// Name of the signature field
    #[arg(long)]
    pub field_name: Option<String>,

    /// Digest algorithm for the timestamp request
    #[arg(long)]
    pub hash: Option<HashAlgorithm>,

    /// Print progress events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Documents to seal
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}
