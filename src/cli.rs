// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `tracerelay`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tracerelay",
    version,
    about = "Run untrusted C/C++ programs under a debug adapter and stream their execution traces.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Defaults to `$TRACERELAY_CONFIG`, then `Tracerelay.toml`. A missing
    /// file at the default location means "all defaults".
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override `[server].listen` (e.g. `0.0.0.0:4710`).
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TRACERELAY_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate the config, print it, but don't start the server.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
