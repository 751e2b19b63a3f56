//! Configuration for the master server.
//!
//! The file is TOML; every section falls back to defaults, so an empty or
//! missing file yields a working master on port 29000. A loaded `Config` is
//! turned into an immutable [`Settings`] generation, which is what the rest of
//! the server reads. Reloading builds a new generation and swaps it in whole.

use crate::ban::{parse_network, BanFilter};
use crate::localizer::{AddressDiscovery, AddressLocalizer};
use serde::{Deserialize, Serialize};
use shared::{MasterHeader, DEFAULT_MAX_PACKET_SIZE, DEFAULT_PORT};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub poll: PollConfig,
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen: ListenConfig,
    /// Common name sent in every list response.
    pub hostname: String,
    pub motd: String,
    pub id: u16,
    /// Age after which a server is re-probed by maintenance.
    pub server_ttl_secs: u64,
    pub servers_per_ip: u16,
    pub banned: BannedConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Empty = all interfaces.
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BannedConfig {
    /// CIDR ranges; a bare address bans a single host.
    pub networks: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Peer masters as `host:port`.
    pub known_masters: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub verbose: bool,
    pub network: NetworkConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connection_timeout_ms: u64,
    /// Largest datagram the master sends or accepts.
    pub max_packet_size: u16,
    /// Receive buffer for probe and federation replies.
    pub max_buffer_size: u16,
    /// Empty = discover from interfaces.
    pub external_ip: String,
    /// Empty = discover from interfaces.
    pub local_networks: Vec<String>,
    /// Liveness probes allowed in flight at once. Read at startup only.
    pub max_concurrent_probes: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            hostname: String::new(),
            motd: String::new(),
            id: 99,
            server_ttl_secs: 5 * 60,
            servers_per_ip: 30,
            banned: BannedConfig::default(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for BannedConfig {
    fn default() -> Self {
        Self {
            networks: vec!["224.0.0.0/4".to_string()],
            message: "You've been banned!".to_string(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 5 * 60,
            known_masters: vec![
                "master1.starsiegeplayers.com:29000".to_string(),
                "master2.starsiegeplayers.com:29000".to_string(),
                "master3.starsiegeplayers.com:29000".to_string(),
            ],
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 2000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE as u16,
            max_buffer_size: 32768,
            external_ip: String::new(),
            local_networks: Vec::new(),
            max_concurrent_probes: 128,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid network {0:?}")]
    InvalidNetwork(String),
    #[error("invalid external address {0:?}")]
    InvalidAddress(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl Config {
    /// Reads `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn listen_addr(&self) -> String {
        let ip = match self.service.listen.ip.as_str() {
            "" => "0.0.0.0",
            ip => ip,
        };
        format!("{}:{}", ip, self.service.listen.port)
    }
}

// ── Settings generations ─────────────────────────────────────────────────────

/// One immutable configuration generation with its derived state.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: Config,
    pub ban: BanFilter,
    pub localizer: AddressLocalizer,
}

impl Settings {
    /// Validates `config` and derives the ban filter and address localizer.
    ///
    /// Explicit addressing in the configuration wins over discovery; without
    /// either, loopback endpoints are presented as announced.
    pub fn build(
        config: Config,
        discovery: Option<&dyn AddressDiscovery>,
    ) -> Result<Self, ConfigError> {
        let ban = BanFilter::parse(
            &config.service.banned.networks,
            &config.service.banned.message,
        )?;

        let network = &config.advanced.network;
        let external_ip = match network.external_ip.trim() {
            "" => discovery.and_then(|d| d.external_ip()),
            ip => Some(
                ip.parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidAddress(ip.to_string()))?,
            ),
        };
        let local_networks = if network.local_networks.is_empty() {
            discovery.map(|d| d.local_networks()).unwrap_or_default()
        } else {
            network
                .local_networks
                .iter()
                .map(|entry| parse_network(entry))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            config,
            ban,
            localizer: AddressLocalizer::new(external_ip, local_networks),
        })
    }

    pub fn server_ttl(&self) -> Duration {
        Duration::from_secs(self.config.service.server_ttl_secs)
    }

    pub fn servers_per_ip(&self) -> u16 {
        self.config.service.servers_per_ip
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.config.advanced.network.connection_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.config.advanced.maintenance.interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll.interval_secs.max(1))
    }

    pub fn known_masters(&self) -> &[String] {
        &self.config.poll.known_masters
    }

    pub fn max_packet_size(&self) -> usize {
        self.config.advanced.network.max_packet_size as usize
    }

    pub fn max_buffer_size(&self) -> usize {
        self.config.advanced.network.max_buffer_size as usize
    }

    pub fn max_concurrent_probes(&self) -> usize {
        self.config.advanced.network.max_concurrent_probes.max(1) as usize
    }

    pub fn verbose(&self) -> bool {
        self.config.advanced.verbose
    }

    /// Header for regular list responses.
    pub fn header(&self) -> MasterHeader {
        MasterHeader {
            master_id: self.config.service.id,
            name: self.config.service.hostname.clone(),
            motd: self.config.service.motd.clone(),
        }
    }

    /// Header for banned callers: same identity, ban message as MOTD.
    pub fn banned_header(&self) -> MasterHeader {
        MasterHeader {
            motd: self.ban.message().to_string(),
            ..self.header()
        }
    }
}

/// Shared pointer to the current settings generation.
#[derive(Debug)]
pub struct SettingsHandle {
    current: RwLock<Arc<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    /// The generation in force right now. Callers keep it for the whole
    /// operation so a concurrent reload never changes values under them.
    pub fn current(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace(&self, settings: Settings) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localizer::StaticDiscovery;

    #[test]
    fn test_defaults_match_reference_master() {
        let config = Config::default();
        assert_eq!(config.service.listen.port, 29000);
        assert_eq!(config.service.server_ttl_secs, 300);
        assert_eq!(config.service.servers_per_ip, 30);
        assert_eq!(config.service.id, 99);
        assert_eq!(config.service.banned.networks, vec!["224.0.0.0/4"]);
        assert!(!config.poll.enabled);
        assert_eq!(config.advanced.maintenance.interval_secs, 60);
        assert_eq!(config.advanced.network.connection_timeout_ms, 2000);
        assert_eq!(config.advanced.network.max_packet_size, 512);
        assert_eq!(config.advanced.network.max_concurrent_probes, 128);
    }

    #[test]
    fn test_zero_probe_limit_still_allows_one() {
        let mut config = Config::default();
        config.advanced.network.max_concurrent_probes = 0;
        let settings = Settings::build(config, None).unwrap();
        assert_eq!(settings.max_concurrent_probes(), 1);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [service]
            hostname = "Test Master"
            servers_per_ip = 4

            [service.banned]
            networks = ["10.0.0.0/8"]
            "#,
        )
        .unwrap();

        assert_eq!(config.service.hostname, "Test Master");
        assert_eq!(config.service.servers_per_ip, 4);
        assert_eq!(config.service.banned.message, "You've been banned!");
        assert_eq!(config.service.listen.port, 29000);
        assert_eq!(config.poll, PollConfig::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/master.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_listen_addr_defaults_to_all_interfaces() {
        let mut config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:29000");
        config.service.listen.ip = "127.0.0.1".to_string();
        config.service.listen.port = 0;
        assert_eq!(config.listen_addr(), "127.0.0.1:0");
    }

    #[test]
    fn test_invalid_ban_network_rejected() {
        let mut config = Config::default();
        config.service.banned.networks = vec!["10.0.0.0/33".to_string()];
        assert!(matches!(
            Settings::build(config, None),
            Err(ConfigError::InvalidNetwork(_))
        ));
    }

    #[test]
    fn test_configured_addressing_overrides_discovery() {
        let discovery = StaticDiscovery {
            external_ip: Some("203.0.113.1".parse().unwrap()),
            local_networks: vec!["192.168.0.0/16".parse().unwrap()],
        };
        let mut config = Config::default();
        config.advanced.network.external_ip = "198.51.100.2".to_string();

        let settings = Settings::build(config, Some(&discovery)).unwrap();
        assert_eq!(
            settings.localizer.external_ip(),
            Some("198.51.100.2".parse().unwrap())
        );
        assert!(settings.localizer.is_local("192.168.4.4".parse().unwrap()));
    }

    #[test]
    fn test_invalid_external_ip_rejected() {
        let mut config = Config::default();
        config.advanced.network.external_ip = "example.com".to_string();
        assert!(matches!(
            Settings::build(config, None),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_banned_header_carries_ban_message() {
        let mut config = Config::default();
        config.service.hostname = "master".to_string();
        config.service.motd = "hello".to_string();
        let settings = Settings::build(config, None).unwrap();

        let header = settings.banned_header();
        assert_eq!(header.name, "master");
        assert_eq!(header.motd, "You've been banned!");
        assert_eq!(settings.header().motd, "hello");
    }

    #[test]
    fn test_handle_swaps_whole_generation() {
        let handle = SettingsHandle::new(Settings::build(Config::default(), None).unwrap());
        let before = handle.current();

        let mut config = Config::default();
        config.service.servers_per_ip = 2;
        handle.replace(Settings::build(config, None).unwrap());

        assert_eq!(before.servers_per_ip(), 30);
        assert_eq!(handle.current().servers_per_ip(), 2);
    }
}
