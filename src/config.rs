//! Static, boot-time configuration: TOML on disk, typed in memory. Not
//! live-reloadable — an explicit scope decision recorded in DESIGN.md,
//! unlike the daemon's hot-reloadable policy set.

use std::fmt;
use std::fs;
use std::net::SocketAddr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::wire::message::{Capability, Context, ZoneName};

fn default_msg_max_size() -> usize {
    65535
}

fn default_prio_buffer_size() -> usize {
    256
}

fn default_normal_buffer_size() -> usize {
    1024
}

fn default_notification_buffer_size() -> usize {
    256
}

fn default_prio_worker_count() -> usize {
    4
}

fn default_normal_worker_count() -> usize {
    8
}

fn default_notification_worker_count() -> usize {
    2
}

fn default_keep_alive_period_secs() -> u64 {
    60
}

fn default_tcp_timeout_secs() -> u64 {
    30
}

fn default_delegation_query_validity_secs() -> i64 {
    600
}

fn default_query_validity_secs() -> i64 {
    600
}

fn default_address_query_validity_secs() -> i64 {
    600
}

fn default_max_cache_validity_hours() -> i64 {
    24
}

fn default_checkpoint_interval_secs() -> u64 {
    300
}

fn default_reap_verify_timeout_secs() -> i64 {
    60
}

/// The server's full boot-time configuration, parsed from a TOML file at
/// `--config PATH`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Path to the PEM-encoded root zone delegation key, loaded at boot.
    pub root_zone_public_key_path: Utf8PathBuf,

    /// The address this server listens on.
    pub server_address: SocketAddr,

    #[serde(default = "default_keep_alive_period_secs")]
    pub keep_alive_period_secs: u64,
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,

    pub tls_certificate_file: Utf8PathBuf,
    pub tls_private_key_file: Utf8PathBuf,

    /// Skip verifying peer certificates. Testing only; production must pin
    /// via `root_zone_public_key_path` instead.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    #[serde(default = "default_msg_max_size")]
    pub msg_max_size: usize,

    #[serde(default = "default_prio_buffer_size")]
    pub prio_buffer_size: usize,
    #[serde(default = "default_normal_buffer_size")]
    pub normal_buffer_size: usize,
    #[serde(default = "default_notification_buffer_size")]
    pub notification_buffer_size: usize,

    #[serde(default = "default_prio_worker_count")]
    pub prio_worker_count: usize,
    #[serde(default = "default_normal_worker_count")]
    pub normal_worker_count: usize,
    #[serde(default = "default_notification_worker_count")]
    pub notification_worker_count: usize,

    #[serde(default = "default_cache_size")]
    pub zone_key_cache_size: usize,
    #[serde(default = "default_cache_warn_size")]
    pub zone_key_cache_warn_size: usize,
    #[serde(default = "default_max_public_keys_per_zone")]
    pub max_public_keys_per_zone: usize,

    #[serde(default = "default_cache_size")]
    pub assertion_cache_hard_size: usize,
    #[serde(default = "default_cache_warn_size")]
    pub assertion_cache_warn_size: usize,
    #[serde(default = "default_cache_size")]
    pub negative_assertion_cache_hard_size: usize,
    #[serde(default = "default_cache_size")]
    pub pending_key_cache_hard_size: usize,
    #[serde(default = "default_cache_size")]
    pub pending_query_cache_hard_size: usize,
    #[serde(default = "default_cache_size")]
    pub capabilities_cache_hard_size: usize,

    #[serde(default)]
    pub capabilities: Vec<Capability>,

    #[serde(default = "default_delegation_query_validity_secs")]
    pub delegation_query_validity_secs: i64,
    #[serde(default = "default_query_validity_secs")]
    pub query_validity_secs: i64,
    #[serde(default = "default_address_query_validity_secs")]
    pub address_query_validity_secs: i64,
    #[serde(default = "default_max_cache_validity_hours")]
    pub max_cache_validity_hours: i64,

    /// Zones/contexts over which this server is itself authoritative
    /// (as opposed to a resolving cache for others' zones).
    #[serde(default)]
    pub context_authority: Vec<Context>,
    #[serde(default)]
    pub zone_authority: Vec<ZoneName>,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub zone_key_checkpoint_interval_secs: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub assertion_checkpoint_interval_secs: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub negative_assertion_checkpoint_interval_secs: u64,

    pub check_point_path: Utf8PathBuf,
    #[serde(default)]
    pub pre_load_caches: bool,

    /// How long a pending-key or pending-query entry may wait before it is
    /// reaped and its blocked senders are told `NoAssertionAvail`.
    #[serde(default = "default_reap_verify_timeout_secs")]
    pub reap_verify_timeout_secs: i64,
}

fn default_cache_size() -> usize {
    10_000
}

fn default_cache_warn_size() -> usize {
    8_000
}

fn default_max_public_keys_per_zone() -> usize {
    8
}

/// A failure loading or parsing the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read(Utf8PathBuf, std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(path, e) => write!(f, "cannot read '{path}': {e}"),
            ConfigError::Parse(e) => write!(f, "cannot parse configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn load(path: &Utf8PathBuf) -> Result<Self, ConfigError> {
        let text =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.clone(), e))?;
        toml::from_str(&text).map_err(ConfigError::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config_with_defaults_filled_in() {
        let text = r#"
            root_zone_public_key_path = "root.pem"
            server_address = "127.0.0.1:5555"
            tls_certificate_file = "cert.pem"
            tls_private_key_file = "key.pem"
            check_point_path = "/var/lib/rainsd/checkpoints"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.msg_max_size, 65535);
        assert_eq!(config.prio_worker_count, 4);
        assert!(!config.insecure_skip_verify);
    }
}
