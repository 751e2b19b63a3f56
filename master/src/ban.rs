//! Banned-network matching.
//!
//! A `BanFilter` is built once per configuration generation and never mutated;
//! reloading the configuration produces a new filter.

use crate::config::ConfigError;
use crate::utils::canonical_ip;
use ipnet::IpNet;
use std::net::IpAddr;

#[derive(Clone, Debug, Default)]
pub struct BanFilter {
    networks: Vec<IpNet>,
    message: String,
}

impl BanFilter {
    pub fn new(networks: Vec<IpNet>, message: impl Into<String>) -> Self {
        Self {
            networks,
            message: message.into(),
        }
    }

    /// Parses CIDR entries, accepting a bare address as a single-host network.
    pub fn parse(entries: &[String], message: &str) -> Result<Self, ConfigError> {
        let mut networks = Vec::with_capacity(entries.len());
        for entry in entries {
            networks.push(parse_network(entry)?);
        }
        Ok(Self::new(networks, message))
    }

    /// Returns the first configured network containing `ip`.
    pub fn matching(&self, ip: IpAddr) -> Option<&IpNet> {
        let ip = canonical_ip(ip);
        self.networks.iter().find(|net| net.contains(&ip))
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.matching(ip).is_some()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }
}

pub(crate) fn parse_network(entry: &str) -> Result<IpNet, ConfigError> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    let ip = entry
        .parse::<IpAddr>()
        .map_err(|_| ConfigError::InvalidNetwork(entry.to_string()))?;
    let host_prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, host_prefix).map_err(|_| ConfigError::InvalidNetwork(entry.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(entries: &[&str]) -> BanFilter {
        let entries: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
        BanFilter::parse(&entries, "You've been banned!").unwrap()
    }

    #[test]
    fn test_multicast_default_is_banned() {
        let bans = filter(&["224.0.0.0/4"]);
        assert!(bans.is_banned("239.1.2.3".parse().unwrap()));
        assert!(!bans.is_banned("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_first_matching_network_reported() {
        let bans = filter(&["10.0.0.0/8", "10.1.0.0/16"]);
        let net = bans.matching("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_bare_address_is_single_host() {
        let bans = filter(&["198.51.100.4"]);
        assert!(bans.is_banned("198.51.100.4".parse().unwrap()));
        assert!(!bans.is_banned("198.51.100.5".parse().unwrap()));
    }

    #[test]
    fn test_host_bits_are_truncated() {
        let bans = filter(&["192.168.1.77/24"]);
        assert_eq!(bans.networks()[0].to_string(), "192.168.1.0/24");
        assert!(bans.is_banned("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_mapped_v6_source_matches_v4_ban() {
        let bans = filter(&["10.0.0.0/8"]);
        assert!(bans.is_banned("::ffff:10.9.9.9".parse().unwrap()));
    }

    #[test]
    fn test_invalid_entry_rejected() {
        let entries = vec!["not-a-network".to_string()];
        assert!(matches!(
            BanFilter::parse(&entries, ""),
            Err(ConfigError::InvalidNetwork(_))
        ));
    }

    #[test]
    fn test_empty_filter_bans_nothing() {
        let bans = BanFilter::default();
        assert!(!bans.is_banned("1.2.3.4".parse().unwrap()));
    }
}
