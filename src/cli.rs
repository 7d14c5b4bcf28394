//! Command-line surface, parsed with `clap`'s derive API.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tinymemd", version, about = "A sharded, in-process key/value cache server speaking the Memcached text and binary protocols")]
pub struct Cli {
    /// TCP port to listen on.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Interface to bind; empty binds all interfaces.
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Unix socket path; overrides --port/--listen when set.
    #[arg(short = 's', long)]
    pub socket: Option<String>,

    /// Max memory budget across all shards, in MiB.
    #[arg(short = 'm', long)]
    pub memory: Option<usize>,

    /// Max concurrent connections.
    #[arg(short = 'c', long)]
    pub connections: Option<usize>,

    /// Number of shards.
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Path to a config file (plain `key = value` lines, `#` comments).
    #[arg(long)]
    pub config: Option<String>,
}
