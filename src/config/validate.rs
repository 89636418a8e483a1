// src/config/validate.rs

use std::net::SocketAddr;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{RelayError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::RelayError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_server(cfg)?;
    validate_pool(cfg)?;
    validate_adapter(cfg)?;
    validate_trace(cfg)?;
    validate_transport(cfg)?;
    Ok(())
}

fn config_error(msg: impl Into<String>) -> RelayError {
    RelayError::ConfigError(msg.into())
}

fn validate_server(cfg: &RawConfigFile) -> Result<()> {
    cfg.server.listen.parse::<SocketAddr>().map_err(|e| {
        config_error(format!(
            "[server].listen '{}' is not a socket address: {e}",
            cfg.server.listen
        ))
    })?;
    Ok(())
}

fn validate_pool(cfg: &RawConfigFile) -> Result<()> {
    let pool = &cfg.pool;
    if pool.max_workers == 0 {
        return Err(config_error("[pool].max_workers must be >= 1 (got 0)"));
    }
    if pool.warm_workers > pool.max_workers {
        return Err(config_error(format!(
            "[pool].warm_workers ({}) cannot exceed max_workers ({})",
            pool.warm_workers, pool.max_workers
        )));
    }
    if pool.acquire_timeout_ms == 0 {
        return Err(config_error("[pool].acquire_timeout_ms must be > 0"));
    }
    Ok(())
}

fn validate_adapter(cfg: &RawConfigFile) -> Result<()> {
    if cfg.adapter.command.trim().is_empty() {
        return Err(config_error("[adapter].command must not be empty"));
    }
    if cfg.adapter.request_timeout_ms == 0 {
        return Err(config_error("[adapter].request_timeout_ms must be > 0"));
    }
    Ok(())
}

fn validate_trace(cfg: &RawConfigFile) -> Result<()> {
    if cfg.trace.max_steps == 0 {
        return Err(config_error("[trace].max_steps must be >= 1 (got 0)"));
    }
    Ok(())
}

fn validate_transport(cfg: &RawConfigFile) -> Result<()> {
    let t = &cfg.transport;
    if t.chunk_size == 0 {
        return Err(config_error("[transport].chunk_size must be >= 1 (got 0)"));
    }
    if t.cache_capacity == 0 {
        return Err(config_error(
            "[transport].cache_capacity must be >= 1 (got 0)",
        ));
    }
    if !(t.prefetch_threshold > 0.0 && t.prefetch_threshold <= 1.0) {
        return Err(config_error(format!(
            "[transport].prefetch_threshold must be in (0, 1] (got {})",
            t.prefetch_threshold
        )));
    }
    Ok(())
}
