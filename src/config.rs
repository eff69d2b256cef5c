//! Hub server configuration
//!
//! Parsed from YAML with serde_yaml. Missing optional keys fall back to the
//! `default_*` functions below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::network::acl::{self, AccessControl};
use crate::servers::hub::auction::AuctionLimits;

/// Longest credential the auth frames can carry (32-byte field, NUL included).
pub const CREDENTIAL_MAX: usize = 31;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // ============================================
    // MySQL Database Configuration
    // ============================================
    pub sql_ip: String,

    #[serde(default = "default_sql_port")]
    pub sql_port: u16,

    pub sql_id: String,
    pub sql_pw: String,
    pub sql_db: String,

    // ============================================
    // Hub listener (world servers connect here)
    // ============================================
    #[serde(default = "default_hub_ip")]
    pub hub_ip: String,

    #[serde(default = "default_hub_port")]
    pub hub_port: u16,

    /// Credentials world servers must present
    pub hub_id: String,
    pub hub_pw: String,

    /// IPv4 masks allowed to register as world servers. Empty allows all.
    #[serde(default)]
    pub world_allow: Vec<String>,

    #[serde(default = "default_max_world_servers")]
    pub max_world_servers: usize,

    /// Autosave interval in seconds handed to world servers
    #[serde(default = "default_save_time")]
    pub save_time: u32,

    // ============================================
    // Authentication tier link
    // ============================================
    pub login_ip: String,

    #[serde(default = "default_login_port")]
    pub login_port: u16,

    /// Credentials the hub presents to the login server
    pub login_id: String,
    pub login_pw: String,

    #[serde(default)]
    pub limits: Limits,
}

/// Tunables for caps, timeouts and sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_auction_max_listings")]
    pub auction_max_listings: usize,

    #[serde(default = "default_auction_max_bids")]
    pub auction_max_bids: usize,

    /// Minimum delay before settling a listing recovered at startup
    #[serde(default = "default_auction_grace_secs")]
    pub auction_grace_secs: u64,

    #[serde(default = "default_relay_ttl_secs")]
    pub relay_ttl_secs: u64,

    #[serde(default = "default_relay_max_pending")]
    pub relay_max_pending: usize,

    #[serde(default = "default_relay_sweep_secs")]
    pub relay_sweep_secs: u64,

    #[serde(default = "default_disconnect_timeout_secs")]
    pub disconnect_timeout_secs: u64,

    #[serde(default = "default_online_cleanup_secs")]
    pub online_cleanup_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            auction_max_listings: default_auction_max_listings(),
            auction_max_bids: default_auction_max_bids(),
            auction_grace_secs: default_auction_grace_secs(),
            relay_ttl_secs: default_relay_ttl_secs(),
            relay_max_pending: default_relay_max_pending(),
            relay_sweep_secs: default_relay_sweep_secs(),
            disconnect_timeout_secs: default_disconnect_timeout_secs(),
            online_cleanup_secs: default_online_cleanup_secs(),
        }
    }
}

impl Limits {
    pub fn auction(&self) -> AuctionLimits {
        AuctionLimits {
            max_listings: self.auction_max_listings,
            max_bids: self.auction_max_bids,
            grace: Duration::from_secs(self.auction_grace_secs),
        }
    }

    pub fn relay_ttl(&self) -> Duration {
        Duration::from_secs(self.relay_ttl_secs)
    }

    pub fn relay_sweep(&self) -> Duration {
        Duration::from_secs(self.relay_sweep_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }

    pub fn online_cleanup(&self) -> Duration {
        Duration::from_secs(self.online_cleanup_secs)
    }
}

// ============================================
// Default value functions
// ============================================

fn default_sql_port() -> u16 {
    3306
}

fn default_hub_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_hub_port() -> u16 {
    2005
}

fn default_login_port() -> u16 {
    2000
}

fn default_max_world_servers() -> usize {
    30
}

fn default_save_time() -> u32 {
    60
}

fn default_auction_max_listings() -> usize {
    5
}

fn default_auction_max_bids() -> usize {
    5
}

fn default_auction_grace_secs() -> u64 {
    10
}

fn default_relay_ttl_secs() -> u64 {
    60
}

fn default_relay_max_pending() -> usize {
    256
}

fn default_relay_sweep_secs() -> u64 {
    10
}

fn default_disconnect_timeout_secs() -> u64 {
    20
}

fn default_online_cleanup_secs() -> u64 {
    600
}

impl ServerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use hubd::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_file("conf/hub.yaml")
    ///     .expect("Failed to load config");
    /// println!("SQL DB: {}", config.sql_db);
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(contents)
            .context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.sql_ip.is_empty(), "sql_ip cannot be empty");
        anyhow::ensure!(!self.sql_id.is_empty(), "sql_id cannot be empty");
        anyhow::ensure!(!self.sql_db.is_empty(), "sql_db cannot be empty");
        anyhow::ensure!(!self.login_ip.is_empty(), "login_ip cannot be empty");
        anyhow::ensure!(!self.hub_id.is_empty(), "hub_id cannot be empty");

        for (key, value) in [
            ("hub_id", &self.hub_id),
            ("hub_pw", &self.hub_pw),
            ("login_id", &self.login_id),
            ("login_pw", &self.login_pw),
        ] {
            anyhow::ensure!(
                value.len() <= CREDENTIAL_MAX,
                "{} too long: {} chars (max {})",
                key,
                value.len(),
                CREDENTIAL_MAX
            );
        }

        // slot index goes out as one byte
        anyhow::ensure!(
            (1..=255).contains(&self.max_world_servers),
            "max_world_servers must be between 1 and 255, got {}",
            self.max_world_servers
        );

        for mask in &self.world_allow {
            anyhow::ensure!(
                acl::parse_ipmask(mask).is_some(),
                "invalid world_allow entry: {}",
                mask
            );
        }

        anyhow::ensure!(self.limits.relay_max_pending > 0, "relay_max_pending cannot be 0");
        anyhow::ensure!(self.limits.relay_sweep_secs > 0, "relay_sweep_secs cannot be 0");
        anyhow::ensure!(self.limits.online_cleanup_secs > 0, "online_cleanup_secs cannot be 0");

        Ok(())
    }

    /// Parsed `world_allow` list.
    pub fn world_acl(&self) -> Vec<AccessControl> {
        self.world_allow.iter().filter_map(|m| acl::parse_ipmask(m)).collect()
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }
}
