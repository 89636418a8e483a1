// src/lib.rs

pub mod cli;
pub mod config;
pub mod crypto;
pub mod dap;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod server;
pub mod session;
pub mod store;
pub mod trace;
pub mod transport;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, default_config_path, load_or_default};
use crate::crypto::CryptoHelper;
use crate::dap::RealAdapterBackend;
use crate::errors::RelayError;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::pool::{LocalProvisioner, WorkerPool};
use crate::server::Server;
use crate::session::SessionManager;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading (+ `--listen` override)
/// - session store and session manager
/// - worker pool with its warm workers
/// - debug adapter backend and chunk crypto
/// - the client server, stopped by Ctrl-C
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = effective_config(&args)?;

    if args.dry_run {
        print_dry_run(&cfg)?;
        return Ok(());
    }

    let store = store::open_store(&cfg.store)?;
    let sessions = Arc::new(SessionManager::new(store, cfg.store.session_ttl()));

    let provisioner = Arc::new(LocalProvisioner::new(cfg.pool.workspace_root.clone()));
    let pool = WorkerPool::new(cfg.pool.max_workers, provisioner);
    if let Err(e) = pool.warm_up(cfg.pool.warm_workers).await {
        // Workers are provisioned lazily on acquire as well.
        warn!(error = %e, "warm-up incomplete");
    }

    let adapter = Arc::new(RealAdapterBackend::from_config(&cfg.adapter));
    let crypto = if cfg.transport.encrypt {
        Some(CryptoHelper::from_env(&cfg.crypto.secret_env)?)
    } else {
        None
    };

    let pipeline = Pipeline::new(
        pool,
        sessions,
        adapter,
        crypto,
        PipelineSettings::from_config(&cfg),
    )?;

    let server = Server::bind(&cfg.server.listen, pipeline).await?;
    info!(addr = %server.local_addr()?, max_workers = cfg.pool.max_workers, "tracerelay ready");

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("tracerelay stopped");
    Ok(())
}

/// Load the config and apply CLI overrides on top of it.
fn effective_config(args: &CliArgs) -> Result<ConfigFile> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut cfg = load_or_default(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    if let Some(listen) = &args.listen {
        listen.parse::<SocketAddr>().map_err(|e| {
            RelayError::ConfigError(format!("--listen '{listen}' is not a socket address: {e}"))
        })?;
        cfg.server.listen = listen.clone();
    }
    Ok(cfg)
}

/// Print the effective configuration as TOML.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    let rendered = toml::to_string_pretty(cfg).context("rendering effective config")?;
    println!("tracerelay dry-run");
    println!();
    print!("{rendered}");
    debug!("dry-run complete (server not started)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(listen: Option<&str>) -> CliArgs {
        CliArgs {
            config: None,
            listen: listen.map(str::to_string),
            log_level: None,
            dry_run: true,
        }
    }

    #[test]
    fn listen_override_is_applied() {
        let cfg = effective_config(&args(Some("0.0.0.0:9000"))).unwrap();
        assert_eq!(cfg.server.listen, "0.0.0.0:9000");
    }

    #[test]
    fn listen_override_is_validated() {
        assert!(effective_config(&args(Some("not-an-addr"))).is_err());
    }
}
