use anyhow::{Context, Result};
use caserve_core::EngineConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Server configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Stream listener bind address.
    pub tcp_bind: SocketAddr,
    // Datagram search listener bind address.
    pub udp_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Declared payloads above this size close the connection.
    pub max_frame_bytes: usize,
    // Resource table capacity hint.
    pub table_size: usize,
    // Outbound high-water mark per client.
    pub max_send_bytes: usize,
    // Max time to wait for a put or read completion.
    pub put_notify_timeout_ms: u64,
    // Unclaimed datagram channels are reaped after this long.
    pub provisional_ttl_ms: u64,
    // Simulated scanner period; zero disables the scanner.
    pub scan_interval_ms: u64,
    // Optional YAML record file loaded at startup.
    pub records_path: Option<PathBuf>,
}

const DEFAULT_BIND: &str = "0.0.0.0:5064";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
const DEFAULT_TABLE_SIZE: usize = 4096;
const DEFAULT_MAX_SEND_BYTES: usize = 1024 * 1024;
const DEFAULT_PUT_NOTIFY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROVISIONAL_TTL_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
struct ServerConfigOverride {
    tcp_bind: Option<String>,
    udp_bind: Option<String>,
    metrics_bind: Option<String>,
    max_frame_bytes: Option<usize>,
    table_size: Option<usize>,
    max_send_bytes: Option<usize>,
    put_notify_timeout_ms: Option<u64>,
    provisional_ttl_ms: Option<u64>,
    scan_interval_ms: Option<u64>,
    records: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let tcp_bind = parse_addr("CASERVE_TCP_BIND", DEFAULT_BIND)?;
        let udp_bind = parse_addr("CASERVE_UDP_BIND", DEFAULT_BIND)?;
        let metrics_bind = parse_addr("CASERVE_METRICS_BIND", DEFAULT_METRICS_BIND)?;
        let max_frame_bytes =
            positive_env("CASERVE_MAX_FRAME_BYTES").unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let table_size = positive_env("CASERVE_TABLE_SIZE").unwrap_or(DEFAULT_TABLE_SIZE);
        let max_send_bytes =
            positive_env("CASERVE_MAX_SEND_BYTES").unwrap_or(DEFAULT_MAX_SEND_BYTES);
        let put_notify_timeout_ms =
            positive_env("CASERVE_PUT_NOTIFY_TIMEOUT_MS").unwrap_or(DEFAULT_PUT_NOTIFY_TIMEOUT_MS);
        let provisional_ttl_ms =
            positive_env("CASERVE_PROVISIONAL_TTL_MS").unwrap_or(DEFAULT_PROVISIONAL_TTL_MS);
        // Zero is meaningful here: no scanner.
        let scan_interval_ms = std::env::var("CASERVE_SCAN_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let records_path = std::env::var("CASERVE_RECORDS").ok().map(PathBuf::from);
        Ok(Self {
            tcp_bind,
            udp_bind,
            metrics_bind,
            max_frame_bytes,
            table_size,
            max_send_bytes,
            put_notify_timeout_ms,
            provisional_ttl_ms,
            scan_interval_ms,
            records_path,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CASERVE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read CASERVE_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: ServerConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse server config yaml")?;
        if let Some(value) = override_cfg.tcp_bind {
            self.tcp_bind = value.parse().with_context(|| "parse tcp_bind")?;
        }
        if let Some(value) = override_cfg.udp_bind {
            self.udp_bind = value.parse().with_context(|| "parse udp_bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.max_frame_bytes
            && value > 0
        {
            self.max_frame_bytes = value;
        }
        if let Some(value) = override_cfg.table_size
            && value > 0
        {
            self.table_size = value;
        }
        if let Some(value) = override_cfg.max_send_bytes
            && value > 0
        {
            self.max_send_bytes = value;
        }
        if let Some(value) = override_cfg.put_notify_timeout_ms
            && value > 0
        {
            self.put_notify_timeout_ms = value;
        }
        if let Some(value) = override_cfg.provisional_ttl_ms
            && value > 0
        {
            self.provisional_ttl_ms = value;
        }
        if let Some(value) = override_cfg.scan_interval_ms {
            self.scan_interval_ms = value;
        }
        if let Some(value) = override_cfg.records {
            self.records_path = Some(value);
        }
        Ok(())
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            table_size: self.table_size,
            max_frame_bytes: self.max_frame_bytes,
            max_send_bytes: self.max_send_bytes,
            put_notify_timeout: Duration::from_millis(self.put_notify_timeout_ms),
            ..EngineConfig::default()
        }
    }

    pub fn provisional_ttl(&self) -> Duration {
        Duration::from_millis(self.provisional_ttl_ms)
    }

    pub fn scan_interval(&self) -> Option<Duration> {
        (self.scan_interval_ms > 0).then(|| Duration::from_millis(self.scan_interval_ms))
    }
}

fn parse_addr(key: &str, default: &str) -> Result<SocketAddr> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("parse {key}"))
}

fn positive_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}
