use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SafeBox CLI: encrypted mmap key-value files.
///
/// Ключ шифрования: SB_KEY_HEX или SB_KEY_BASE64 (32 байта).
#[derive(Parser, Debug)]
#[command(name = "safebox", version, about = "SafeBox CLI", arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Put key/value (literal, hex:.., @file or - for stdin)
    Put {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    /// Get key
    Get {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        key: String,
    },
    /// Delete one or more keys
    Del {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
    },
    /// List all readable entries
    List {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove every entry of the file
    Clear {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: String,
    },
    /// Pages, tails, entry count, journal usage and metrics
    Status {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Per-file record counts in the shared recovery journal
    Journal {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}
