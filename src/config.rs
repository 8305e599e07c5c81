use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DhtError, Result};
use crate::registry::NodeRole;
use crate::{
    BUCKET_REFRESH_INTERVAL, CONTACT_EXPIRATION, REPUBLISH_INTERVAL, REQUEST_TIMEOUT, SERVICE_TTL,
};

/// Configuration of a DHT node.
///
/// Loaded from an optional TOML file and then overridden by environment variables. Durations are
/// written in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IP address the DHT socket binds to.
    pub listen_address: String,
    pub dht_port: u16,
    /// Address advertised to peers instead of the bound one.
    pub external_ip: Option<String>,
    /// `host:port` of peers used to join the network.
    pub bootstrap_nodes: Vec<String>,
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    pub node_role: NodeRole,
    pub num_shards: u32,
    pub api_port: u16,
    pub grpc_port: u16,
    pub storage_path: PathBuf,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub contact_expiry: Duration,
    #[serde(with = "duration_secs")]
    pub republish_interval: Duration,
    #[serde(with = "duration_secs")]
    pub service_ttl: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_address: "0.0.0.0".to_string(),
            dht_port: 4000,
            external_ip: None,
            bootstrap_nodes: Vec::new(),
            refresh_interval: Duration::from_secs(BUCKET_REFRESH_INTERVAL),
            node_role: NodeRole::Capacitor,
            num_shards: 1,
            api_port: 8080,
            grpc_port: 9090,
            storage_path: PathBuf::from("./data/dht"),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT),
            contact_expiry: Duration::from_secs(CONTACT_EXPIRATION),
            republish_interval: Duration::from_secs(REPUBLISH_INTERVAL),
            service_ttl: Duration::from_secs(SERVICE_TTL),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads the config file at `path` and applies environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|err| DhtError::Config(format!("{}: {}", path.display(), err)))?;
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Builds a config from defaults and environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Overrides fields from the variables `lookup` knows about, then validates the result.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("DHT_LISTEN_ADDRESS") {
            self.listen_address = value;
        }
        if let Some(value) = lookup("DHT_PORT") {
            self.dht_port = parse_var("DHT_PORT", &value)?;
        }
        if let Some(value) = lookup("DHT_EXTERNAL_IP") {
            self.external_ip = if value.trim().is_empty() {
                None
            } else {
                Some(value)
            };
        }
        if let Some(value) = lookup("DHT_BOOTSTRAP_NODES") {
            self.bootstrap_nodes = parse_bootstrap_nodes(&value);
        }
        if let Some(value) = lookup("DHT_REFRESH_INTERVAL_MINUTES") {
            let minutes: u64 = parse_var("DHT_REFRESH_INTERVAL_MINUTES", &value)?;
            self.refresh_interval = minutes
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    DhtError::Config(format!(
                        "invalid value for DHT_REFRESH_INTERVAL_MINUTES: `{}`",
                        value
                    ))
                })?;
        }
        if let Some(value) = lookup("NODE_TYPE") {
            self.node_role = value.parse()?;
        }
        if let Some(value) = lookup("NUM_SHARDS") {
            self.num_shards = parse_var("NUM_SHARDS", &value)?;
        }
        if let Some(value) = lookup("API_PORT") {
            self.api_port = parse_var("API_PORT", &value)?;
        }
        if let Some(value) = lookup("GRPC_PORT") {
            self.grpc_port = parse_var("GRPC_PORT", &value)?;
        }
        if let Some(value) = lookup("DHT_STORAGE_PATH") {
            self.storage_path = PathBuf::from(value);
        }
        self.validate()
    }

    /// Checks that every interval and timeout is non-zero. A zero interval would make the
    /// background loops spin.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("refresh_interval", self.refresh_interval),
            ("republish_interval", self.republish_interval),
            ("contact_expiry", self.contact_expiry),
            ("request_timeout", self.request_timeout),
            ("service_ttl", self.service_ttl),
        ];
        for (name, duration) in durations.iter() {
            if duration.is_zero() {
                return Err(DhtError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    /// Returns the `ip:port` the DHT socket binds to.
    pub fn dht_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.dht_port)
    }

    /// Adds a bootstrap node unless it is already configured.
    pub fn add_bootstrap_node(&mut self, addr: &str) {
        if !self.bootstrap_nodes.iter().any(|node| node == addr) {
            self.bootstrap_nodes.push(addr.to_string());
        }
    }

    pub fn clear_bootstrap_nodes(&mut self) {
        self.bootstrap_nodes.clear();
    }

    /// Creates the storage directory if it does not exist.
    pub fn ensure_storage_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.storage_path)?;
        Ok(())
    }
}

/// Splits a comma separated list of addresses, dropping blanks.
fn parse_bootstrap_nodes(nodes: &str) -> Vec<String> {
    nodes
        .split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(String::from)
        .collect()
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DhtError::Config(format!("invalid value for {}: `{}`", key, value)))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
