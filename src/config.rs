use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub storage_busy_timeout: Duration,
    pub request_timeout: Duration,
    pub max_report_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw = env::var("RECON_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .with_context(|| format!("RECON_BIND_ADDR is not a socket address: {bind_normalized}"))?;

        let db_path = PathBuf::from(
            env::var("RECON_DB_PATH").unwrap_or_else(|_| "/data/recon/hosts.db".to_string()),
        );

        let storage_busy_timeout = env::var("RECON_STORAGE_BUSY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let request_timeout = env::var("RECON_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        let max_report_bytes = env::var("RECON_MAX_REPORT_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(32 * 1024 * 1024);

        Ok(Self {
            bind_addr,
            db_path,
            storage_busy_timeout,
            request_timeout,
            max_report_bytes,
        })
    }
}
