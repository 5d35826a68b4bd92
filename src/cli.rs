// CLI module - command-line argument parsing
//
// Flags override the optional config file, which overrides built-in
// defaults. Anything not given on the command line stays None here so the
// config resolver can tell "explicitly set" from "defaulted".

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Forward HTTP/HTTPS intercepting proxy with live capture inspection
#[derive(Debug, Parser)]
#[command(name = "breakout-proxy")]
#[command(version = crate::config::VERSION)]
#[command(about = "HTTP breakout proxy with live capture inspection", long_about = None)]
pub struct Cli {
    /// Address to listen on (default 127.0.0.1:8080)
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Disable TLS interception; CONNECT tunnels are spliced opaquely
    #[arg(long)]
    pub no_mitm: bool,

    /// Directory holding ca.pem / ca.key (default ./ca)
    #[arg(long)]
    pub ca_dir: Option<PathBuf>,

    /// Snapshot file for captures, rules, and search history
    /// (default ./captures.json, empty string disables persistence)
    #[arg(long)]
    pub persist: Option<String>,

    /// Captured body cap in bytes (default 1048576)
    #[arg(long)]
    pub max_body: Option<usize>,

    /// Capture ring capacity (default 1000)
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Config file path (default ./breakout.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, short)]
    pub verbose: bool,
}
