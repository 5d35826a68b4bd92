// Configuration for the proxy server
//
// Configuration is resolved in order of precedence:
// 1. Command-line flags (highest priority)
// 2. Config file (./breakout.toml or --config)
// 3. Built-in defaults (lowest priority)

use crate::cli::Cli;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default config file looked up when --config is not given
const DEFAULT_CONFIG_FILE: &str = "breakout.toml";

/// Resolved application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the dual-role listener binds to
    pub listen_addr: SocketAddr,

    /// Whether CONNECT tunnels are intercepted and decrypted
    pub mitm: bool,

    /// Directory for the root CA material
    pub ca_dir: PathBuf,

    /// Snapshot file; None disables persistence entirely
    pub persist_path: Option<PathBuf>,

    /// Captured body cap in bytes
    pub max_body: usize,

    /// Capture ring capacity
    pub capacity: usize,

    /// Seconds between autosave snapshots
    pub autosave_secs: u64,

    /// Debug-level logging
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "127.0.0.1:8080".parse().expect("valid default address"),
            mitm: true,
            ca_dir: PathBuf::from("./ca"),
            persist_path: Some(PathBuf::from("./captures.json")),
            max_body: 1_048_576,
            capacity: 1000,
            autosave_secs: 60,
            verbose: false,
        }
    }
}

/// File-level view of the config; every field optional so partial files
/// merge cleanly over the defaults
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    pub mitm: Option<bool>,
    pub ca_dir: Option<PathBuf>,
    /// Empty string disables persistence
    pub persist: Option<String>,
    pub max_body: Option<usize>,
    pub capacity: Option<usize>,
    pub autosave_secs: Option<u64>,
    pub verbose: Option<bool>,
}

impl Config {
    /// Merge defaults, the config file (if any), and the CLI flags.
    pub fn resolve(cli: &Cli) -> Result<Config> {
        let mut config = Config::default();

        if let Some(file) = load_file(cli.config.as_deref())? {
            if let Some(listen) = file.listen {
                config.listen_addr = listen;
            }
            if let Some(mitm) = file.mitm {
                config.mitm = mitm;
            }
            if let Some(ca_dir) = file.ca_dir {
                config.ca_dir = ca_dir;
            }
            if let Some(persist) = file.persist {
                config.persist_path = persist_path(&persist);
            }
            if let Some(max_body) = file.max_body {
                config.max_body = max_body;
            }
            if let Some(capacity) = file.capacity {
                config.capacity = capacity;
            }
            if let Some(autosave) = file.autosave_secs {
                config.autosave_secs = autosave.max(1);
            }
            if let Some(verbose) = file.verbose {
                config.verbose = verbose;
            }
        }

        if let Some(listen) = cli.listen {
            config.listen_addr = listen;
        }
        if cli.no_mitm {
            config.mitm = false;
        }
        if let Some(ca_dir) = &cli.ca_dir {
            config.ca_dir = ca_dir.clone();
        }
        if let Some(persist) = &cli.persist {
            config.persist_path = persist_path(persist);
        }
        if let Some(max_body) = cli.max_body {
            config.max_body = max_body;
        }
        if let Some(capacity) = cli.capacity {
            config.capacity = capacity.max(1);
        }
        if cli.verbose {
            config.verbose = true;
        }

        Ok(config)
    }
}

/// Empty string means "persistence off"
fn persist_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

/// Read the config file: an explicit --config path must exist; the
/// default path is optional.
fn load_file(explicit: Option<&std::path::Path>) -> Result<Option<FileConfig>> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    if !path.exists() {
        if required {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let parsed: FileConfig = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::debug!("Loaded config file {}", path.display());
    Ok(Some(parsed))
}
