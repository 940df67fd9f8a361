// src/config.rs

//! Manages daemon configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    28016
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// Configuration for TLS encryption of TCP clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// CA bundle used to verify client certificates. When set, clients must present one.
    #[serde(default)]
    pub ca_path: Option<String>,
    /// Compare the `peer_id` asserted in lock requests with the client certificate.
    #[serde(default)]
    pub check_peer_id: bool,
}

fn default_cert_path() -> String {
    "flomd.crt".to_string()
}
fn default_key_path() -> String {
    "flomd.key".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_path: None,
            check_peer_id: false,
        }
    }
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_socket_path")]
    socket_path: String,
    #[serde(default)]
    unicast_address: Option<String>,
    #[serde(default = "default_unicast_port")]
    unicast_port: u16,
    #[serde(default)]
    multicast_address: Option<String>,
    #[serde(default = "default_multicast_port")]
    multicast_port: u16,
    #[serde(with = "humantime_serde", default = "default_idle_lifespan")]
    idle_lifespan: Duration,
    #[serde(with = "humantime_serde", default = "default_locker_sweep_interval")]
    locker_sweep_interval: Duration,
    #[serde(default = "default_locker_idle_periods")]
    locker_idle_periods: u32,
    #[serde(with = "humantime_serde", default = "default_quiesce_grace")]
    quiesce_grace: Duration,
    #[serde(default = "default_max_clients")]
    max_clients: usize,
    #[serde(default)]
    pid_file: Option<String>,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_socket_path() -> String {
    std::env::temp_dir()
        .join("flomd.sock")
        .to_string_lossy()
        .into_owned()
}
fn default_unicast_port() -> u16 {
    28015
}
fn default_multicast_port() -> u16 {
    28015
}
fn default_idle_lifespan() -> Duration {
    Duration::from_secs(5)
}
fn default_locker_sweep_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_locker_idle_periods() -> u32 {
    3
}
fn default_quiesce_grace() -> Duration {
    Duration::from_secs(1)
}
fn default_max_clients() -> usize {
    1024
}

/// Represents the final, validated daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub log_level: String,
    /// Path of the unix domain socket used when no unicast address is set.
    pub socket_path: String,
    /// Address of the TCP listener. When absent, the daemon listens on `socket_path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unicast_address: Option<String>,
    pub unicast_port: u16,
    /// Group (or address) the discovery socket answers on. Discovery is off when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multicast_address: Option<String>,
    pub multicast_port: u16,
    /// How long the daemon may stay without lockers or clients before exiting. Zero means forever.
    #[serde(with = "humantime_serde")]
    pub idle_lifespan: Duration,
    /// Sweep interval used when `idle_lifespan` is zero.
    #[serde(with = "humantime_serde")]
    pub locker_sweep_interval: Duration,
    /// Idle sweeps a locker must see before it is flagged for shutdown.
    pub locker_idle_periods: u32,
    /// Lifespan applied by a non-immediate shutdown request.
    #[serde(with = "humantime_serde")]
    pub quiesce_grace: Duration,
    pub max_clients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            socket_path: default_socket_path(),
            unicast_address: None,
            unicast_port: default_unicast_port(),
            multicast_address: None,
            multicast_port: default_multicast_port(),
            idle_lifespan: default_idle_lifespan(),
            locker_sweep_interval: default_locker_sweep_interval(),
            locker_idle_periods: default_locker_idle_periods(),
            quiesce_grace: default_quiesce_grace(),
            max_clients: default_max_clients(),
            pid_file: None,
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    /// Like `from_file`, but a missing file yields the defaults.
    pub fn from_file_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::from_file(path)
        } else {
            info!("Config file '{}' not found, using defaults.", path);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;

        let config = Config {
            log_level: raw.log_level,
            socket_path: raw.socket_path,
            unicast_address: raw.unicast_address,
            unicast_port: raw.unicast_port,
            multicast_address: raw.multicast_address,
            multicast_port: raw.multicast_port,
            idle_lifespan: raw.idle_lifespan,
            locker_sweep_interval: raw.locker_sweep_interval,
            locker_idle_periods: raw.locker_idle_periods,
            quiesce_grace: raw.quiesce_grace,
            max_clients: raw.max_clients,
            pid_file: raw.pid_file,
            tls: raw.tls,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// How often lockers are checked for idleness.
    pub fn sweep_interval(&self) -> Duration {
        if self.idle_lifespan.is_zero() {
            self.locker_sweep_interval
        } else {
            self.idle_lifespan / 3
        }
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if self.locker_sweep_interval.is_zero() {
            return Err(anyhow!("locker_sweep_interval cannot be 0"));
        }
        if self.quiesce_grace.is_zero() {
            return Err(anyhow!("quiesce_grace cannot be 0"));
        }

        match &self.unicast_address {
            Some(address) => {
                address
                    .parse::<IpAddr>()
                    .map_err(|e| anyhow!("invalid unicast_address '{}': {}", address, e))?;
            }
            None => {
                if self.socket_path.trim().is_empty() {
                    return Err(anyhow!(
                        "socket_path cannot be empty when no unicast_address is set"
                    ));
                }
                if self.tls.enabled {
                    return Err(anyhow!("TLS requires a unicast_address"));
                }
            }
        }

        if let Some(group) = &self.multicast_address {
            if self.unicast_address.is_none() {
                return Err(anyhow!("multicast_address requires a unicast_address"));
            }
            group
                .parse::<IpAddr>()
                .map_err(|e| anyhow!("invalid multicast_address '{}': {}", group, e))?;
            if self.multicast_port == 0 {
                return Err(anyhow!("multicast_port cannot be 0"));
            }
        }

        if !self.idle_lifespan.is_zero() && self.idle_lifespan < Duration::from_millis(30) {
            warn!(
                "very short idle_lifespan ({:?}); the daemon may exit between client requests.",
                self.idle_lifespan
            );
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        } else if self.tls.check_peer_id {
            return Err(anyhow!("tls.check_peer_id requires TLS to be enabled"));
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.unicast_address.is_some() && self.metrics.port == self.unicast_port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the unicast port"
                ));
            }
        }
        Ok(())
    }
}
