//! Configuration loading and validation.
//!
//! Configuration is YAML, loaded once at startup and validated fail-fast:
//! anything structurally wrong (unknown classes, bad CIDRs, missing
//! required fields) exits before any socket opens. The dataplane section
//! can alternatively live in its own file (`dataplane_config_file`), which
//! the control API can re-read and apply at runtime.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dataplane::{Classifier, DataplaneConfig};
use crate::error::{Error, Result};
use crate::stripe::StripeAuth;
use crate::types::{CongestionAlgorithm, Role, SchedulerPolicy, TransportKind, TransportMode};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub role: Role,

    /// Literal IP or `if:<name>`.
    pub bind_ip: String,

    /// Server hostname or IP; required for clients.
    #[serde(default)]
    pub remote_addr: String,

    pub remote_port: u16,

    pub tun_name: String,

    /// Client TUN address, e.g. `10.200.17.2/30`.
    pub tun_cidr: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub multipath_enabled: bool,

    /// Default scheduling policy for classes that don't set one.
    #[serde(default)]
    pub multipath_policy: SchedulerPolicy,

    #[serde(default)]
    pub multipath_paths: Vec<MultipathPathConfig>,

    /// Inline dataplane section; ignored when `dataplane_config_file` is
    /// set.
    #[serde(default)]
    pub dataplane: Option<DataplaneConfig>,

    /// External, hot-reloadable dataplane file (YAML or JSON).
    #[serde(default)]
    pub dataplane_config_file: Option<PathBuf>,

    #[serde(default)]
    pub congestion_algorithm: CongestionAlgorithm,

    #[serde(default)]
    pub transport_mode: TransportMode,

    /// Treat CGNAT-bound paths as Starlink and default them to the striped
    /// transport.
    #[serde(default)]
    pub detect_starlink: bool,

    #[serde(default = "default_starlink_pipes")]
    pub starlink_default_pipes: usize,

    #[serde(default = "default_starlink_transport")]
    pub starlink_transport: TransportKind,

    #[serde(default)]
    pub stripe_enabled: bool,

    /// 0 means `remote_port + 1000`.
    #[serde(default)]
    pub stripe_port: u16,

    #[serde(default = "default_data_shards")]
    pub stripe_data_shards: usize,

    #[serde(default = "default_parity_shards")]
    pub stripe_parity_shards: usize,

    /// Shared key for the stripe auth trailer; plain, `hex:`, or
    /// `base64:`.
    #[serde(default)]
    pub stripe_auth_key: Option<String>,

    #[serde(default = "default_rekey_interval", with = "humantime_serde")]
    pub stripe_rekey_interval: Duration,

    #[serde(default)]
    pub control_api_listen: Option<SocketAddr>,

    #[serde(default)]
    pub control_api_auth_token: Option<String>,

    #[serde(default = "default_telemetry_interval", with = "humantime_serde")]
    pub telemetry_interval: Duration,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_starlink_pipes() -> usize {
    crate::stripe::DEFAULT_PIPES
}
fn default_starlink_transport() -> TransportKind {
    TransportKind::Stripe
}
fn default_data_shards() -> usize {
    crate::stripe::DEFAULT_DATA_SHARDS
}
fn default_parity_shards() -> usize {
    crate::stripe::DEFAULT_PARITY_SHARDS
}
fn default_rekey_interval() -> Duration {
    crate::stripe::auth::DEFAULT_REKEY_INTERVAL
}
fn default_telemetry_interval() -> Duration {
    Duration::from_secs(10)
}

/// TLS material locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub server_name: Option<String>,
    /// Skip server certificate verification (client side).
    #[serde(default)]
    pub insecure: bool,
}

/// One configured path before resolution and pipe expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipathPathConfig {
    pub name: String,

    /// Literal IP or `if:<name>`; falls back to the global `bind_ip`.
    #[serde(default)]
    pub bind_ip: String,

    /// Falls back to the global `remote_addr`.
    #[serde(default)]
    pub remote_addr: String,

    /// Falls back to the global `remote_port`.
    #[serde(default)]
    pub remote_port: u16,

    /// Lower is better.
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default = "default_weight")]
    pub weight: u32,

    /// QUIC: expand into N sibling paths. Stripe: UDP socket fan-out.
    #[serde(default)]
    pub pipes: usize,

    #[serde(default = "default_path_transport")]
    pub transport: TransportKind,
}

fn default_priority() -> u32 {
    1
}
fn default_weight() -> u32 {
    1
}
fn default_path_transport() -> TransportKind {
    TransportKind::Auto
}

impl MultipathPathConfig {
    /// Fill per-path fallbacks from the global config.
    pub fn resolve(&self, cfg: &Config) -> crate::multipath::PathConfig {
        crate::multipath::PathConfig {
            name: self.name.clone(),
            base_name: self.name.clone(),
            bind: if self.bind_ip.is_empty() {
                cfg.bind_ip.clone()
            } else {
                self.bind_ip.clone()
            },
            remote_addr: if self.remote_addr.is_empty() {
                cfg.remote_addr.clone()
            } else {
                self.remote_addr.clone()
            },
            remote_port: if self.remote_port == 0 {
                cfg.remote_port
            } else {
                self.remote_port
            },
            priority: self.priority,
            weight: self.weight.max(1),
            pipes: self.pipes,
            transport: self.transport,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("read config: {e}")))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_ip.is_empty() {
            return Err(Error::InvalidConfig("bind_ip is required".into()));
        }
        if self.remote_port == 0 {
            return Err(Error::InvalidConfig("remote_port is required".into()));
        }
        if self.tun_name.is_empty() {
            return Err(Error::InvalidConfig("tun_name is required".into()));
        }
        if self.tun_cidr.is_empty() {
            return Err(Error::InvalidConfig("tun_cidr is required".into()));
        }
        crate::util::parse_tun_ip(&self.tun_cidr)?;
        if self.role == Role::Client && self.remote_addr.is_empty() {
            return Err(Error::InvalidConfig(
                "remote_addr is required for clients".into(),
            ));
        }

        if self.multipath_enabled {
            let mut names = std::collections::HashSet::new();
            for path in &self.multipath_paths {
                if path.name.is_empty() {
                    return Err(Error::InvalidConfig("path name is required".into()));
                }
                if !names.insert(&path.name) {
                    return Err(Error::InvalidConfig(format!(
                        "duplicate path name {:?}",
                        path.name
                    )));
                }
                if path.weight == 0 {
                    return Err(Error::InvalidConfig(format!(
                        "path {:?}: weight must be ≥ 1",
                        path.name
                    )));
                }
            }
        }

        if self.stripe_data_shards == 0 || self.stripe_data_shards > 255 {
            return Err(Error::InvalidConfig(
                "stripe_data_shards must be 1..=255".into(),
            ));
        }
        if self.stripe_parity_shards > 255 - self.stripe_data_shards {
            return Err(Error::InvalidConfig(format!(
                "stripe_parity_shards must be 0..={}",
                255 - self.stripe_data_shards
            )));
        }

        if let Some(key) = &self.stripe_auth_key {
            crate::stripe::auth::parse_key(key)?;
        }

        // Compile the dataplane once here so a broken ruleset fails startup
        // rather than the first packet.
        self.build_classifier()?;
        Ok(())
    }

    /// The effective dataplane section: external file wins over inline.
    pub fn load_dataplane(&self) -> Result<Option<DataplaneConfig>> {
        if let Some(path) = &self.dataplane_config_file {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
            let dataplane = parse_dataplane(&content)?;
            return Ok(Some(dataplane));
        }
        Ok(self.dataplane.clone())
    }

    /// Compile the classifier for the current dataplane configuration.
    pub fn build_classifier(&self) -> Result<Classifier> {
        match self.load_dataplane()? {
            Some(dataplane) => Classifier::compile(&dataplane),
            None => Ok(Classifier::single_default_with_policy(
                self.multipath_policy,
            )),
        }
    }

    /// Stripe listener / destination port.
    pub fn stripe_port(&self) -> u16 {
        if self.stripe_port != 0 {
            self.stripe_port
        } else {
            self.remote_port.wrapping_add(1000)
        }
    }

    /// Configured auth trailer, if any.
    pub fn stripe_auth(&self) -> Result<Option<StripeAuth>> {
        match &self.stripe_auth_key {
            Some(key) => Ok(Some(StripeAuth::from_config(key, self.stripe_rekey_interval)?)),
            None => Ok(None),
        }
    }

    /// The client's TUN address.
    pub fn tun_ip(&self) -> Result<std::net::Ipv4Addr> {
        crate::util::parse_tun_ip(&self.tun_cidr)
    }

    /// Paths the client should bring up: the configured multipath set, or
    /// a single implicit path built from the global endpoint settings.
    pub fn client_paths(&self) -> Vec<crate::multipath::PathConfig> {
        if self.multipath_enabled && !self.multipath_paths.is_empty() {
            self.multipath_paths.iter().map(|p| p.resolve(self)).collect()
        } else {
            vec![crate::multipath::PathConfig {
                name: "default".into(),
                base_name: "default".into(),
                bind: self.bind_ip.clone(),
                remote_addr: self.remote_addr.clone(),
                remote_port: self.remote_port,
                priority: 1,
                weight: 1,
                pipes: 1,
                transport: TransportKind::Auto,
            }]
        }
    }
}

/// Parse a dataplane document as YAML (which also covers JSON).
pub fn parse_dataplane(content: &str) -> Result<DataplaneConfig> {
    serde_yaml::from_str(content).map_err(|e| Error::Config(format!("parse dataplane: {e}")))
}

/// Initialize tracing from the configured level and format.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("init logging: {e}")))?;
    } else {
        registry
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("init logging: {e}")))?;
    }
    Ok(())
}
