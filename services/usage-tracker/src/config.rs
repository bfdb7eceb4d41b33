use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct UsageTrackerConfig {
    pub server_host: String,
    pub server_port: u16,
    pub data_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub retention_sweep_interval_secs: u64,
    pub enable_retention_sweep: bool,
    pub request_timeout_secs: u64,
    pub log_level: String,
}

impl Default for UsageTrackerConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 8184,
            data_dir: PathBuf::from("data/usage"),
            catalog_path: PathBuf::from("config/catalog.json"),
            retention_sweep_interval_secs: 3600,
            enable_retention_sweep: true,
            request_timeout_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl UsageTrackerConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(host) = env::var("USAGE_HOST") {
            cfg.server_host = host;
        }
        if let Ok(port) = env::var("USAGE_PORT") {
            cfg.server_port = port.parse().context("USAGE_PORT must be a valid u16")?;
        }
        if let Ok(dir) = env::var("USAGE_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("USAGE_CATALOG_PATH") {
            cfg.catalog_path = PathBuf::from(path);
        }
        if let Ok(interval) = env::var("RETENTION_SWEEP_INTERVAL_SECS") {
            cfg.retention_sweep_interval_secs = interval
                .parse()
                .context("RETENTION_SWEEP_INTERVAL_SECS must be a positive integer")?;
        }
        if let Ok(flag) = env::var("ENABLE_RETENTION_SWEEP") {
            cfg.enable_retention_sweep = parse_bool(&flag)
                .with_context(|| format!("ENABLE_RETENTION_SWEEP is invalid: {flag}"))?;
        }
        if let Ok(timeout) = env::var("REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout_secs = timeout
                .parse()
                .context("REQUEST_TIMEOUT_SECS must be a positive integer")?;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            cfg.log_level = level;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_directory(&self.data_dir)?;

        if !self.catalog_path.is_file() {
            anyhow::bail!(
                "catalog file {} does not exist",
                self.catalog_path.display()
            );
        }
        if self.retention_sweep_interval_secs == 0 {
            anyhow::bail!("RETENTION_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be greater than zero");
        }

        Ok(())
    }
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            anyhow::bail!("{} exists but is not a directory", path.display());
        }
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("unable to create data directory {}", path.display()))?;
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => anyhow::bail!("invalid boolean value {value}"),
    }
}
