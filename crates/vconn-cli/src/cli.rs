//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-memory mesh and print each messenger's diagnostics
    Simulate {
        /// Number of storage members
        #[arg(short, long)]
        members: Option<usize>,
        /// Number of clients
        #[arg(long)]
        clients: Option<usize>,
        /// Messages each sender sends to each peer
        #[arg(short = 'n', long)]
        messages: Option<usize>,
        /// Sever the link between the first two members afterwards
        #[arg(long)]
        sever: bool,
        /// Pretty-print the JSON report
        #[arg(long)]
        pretty: bool,
    },
    /// Print or check configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print a configuration preset as TOML
    Show {
        #[arg(short, long, value_enum, default_value_t = Preset::Default)]
        preset: Preset,
    },
    /// Load a configuration file and validate it
    Check {
        /// Path to the TOML file
        path: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    Default,
    Testing,
    Strict,
    /// The effective configuration after loading `--config`
    Effective,
}
