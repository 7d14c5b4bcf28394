//! Server configuration: built-in defaults, overridden by an optional
//! config file, overridden again by explicit CLI flags.
//!
//! The config file format is deliberately not TOML - it is the bare
//! `key = value` / `# comment` format real Memcached-adjacent tools ship,
//! so values like `listen = 0.0.0.0` don't need quoting. Unknown keys and
//! values that fail to parse are silently skipped rather than failing the
//! whole file, per the format's own forgiving contract.

use crate::cli::Cli;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub listen: String,
    pub socket: Option<String>,
    pub memory_mib: usize,
    pub connections: usize,
    pub threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 11211,
            listen: String::new(),
            socket: None,
            memory_mib: 64,
            connections: 1024,
            threads: 4,
        }
    }
}

impl Config {
    pub fn total_max_bytes(&self) -> usize {
        self.memory_mib * 1024 * 1024
    }

    /// Builds the effective config: defaults, then an optional config
    /// file, then CLI flags, each layer overriding the previous.
    pub async fn load(cli: &Cli) -> std::io::Result<Self> {
        let mut config = Config::default();

        if let Some(path) = &cli.config {
            let contents = tokio::fs::read_to_string(path).await?;
            apply_file(&mut config, &contents);
        }

        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(listen) = &cli.listen {
            config.listen = listen.clone();
        }
        if let Some(socket) = &cli.socket {
            config.socket = Some(socket.clone());
        }
        if let Some(memory) = cli.memory {
            config.memory_mib = memory;
        }
        if let Some(connections) = cli.connections {
            config.connections = connections;
        }
        if let Some(threads) = cli.threads {
            config.threads = threads;
        }

        Ok(config)
    }

    /// Minimal sanity checks; a config producing an unusable server
    /// (zero shards, zero connection budget) is a fatal init error.
    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("threads must be at least 1".to_string());
        }
        if self.connections == 0 {
            return Err("connections must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn is_unix_socket(&self) -> bool {
        self.socket.is_some()
    }
}

fn apply_file(config: &mut Config, contents: &str) {
    for raw_line in contents.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "port" => {
                if let Ok(v) = value.parse() {
                    config.port = v;
                }
            }
            "listen" => config.listen = value.to_string(),
            "memory" => {
                if let Ok(v) = value.parse() {
                    config.memory_mib = v;
                }
            }
            "connections" => {
                if let Ok(v) = value.parse() {
                    config.connections = v;
                }
            }
            "threads" => {
                if let Ok(v) = value.parse() {
                    config.threads = v;
                }
            }
            _ => {} // unknown keys are silently ignored
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

pub fn bind_target(config: &Config) -> crate::server::Bind {
    match &config.socket {
        Some(path) => crate::server::Bind::Unix { path: path.clone() },
        None => crate::server::Bind::Tcp {
            host: config.listen.clone(),
            port: config.port,
        },
    }
}
