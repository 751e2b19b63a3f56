//! Address localization for servers and callers behind NAT.
//!
//! Game servers running on the master's own host announce themselves from a
//! loopback address. External callers cannot reach that, so the main view
//! presents such servers under the master's externally visible address, while
//! callers on one of the master's own networks get the announced address.

use crate::utils::canonical_ip;
use ipnet::{IpNet, Ipv4Net};
use log::warn;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Source of the master's own addressing facts.
pub trait AddressDiscovery: Send + Sync {
    /// The address external callers reach this host on, if known.
    fn external_ip(&self) -> Option<IpAddr>;
    /// Networks this host is directly attached to.
    fn local_networks(&self) -> Vec<IpNet>;
}

/// Discovers addressing from the host's network interfaces.
///
/// There is no NAT traversal here: behind NAT the interface addresses are all
/// private, `external_ip` returns `None`, and the operator is expected to set
/// the external address in the configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterfaceDiscovery;

impl InterfaceDiscovery {
    fn interface_nets() -> Vec<Ipv4Net> {
        let interfaces = match get_if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("unable to enumerate network interfaces: {}", e);
                return Vec::new();
            }
        };

        interfaces
            .into_iter()
            .filter_map(|iface| match iface.addr {
                get_if_addrs::IfAddr::V4(v4) => {
                    let prefix = u32::from(v4.netmask).count_ones() as u8;
                    Ipv4Net::new(v4.ip, prefix).ok()
                }
                get_if_addrs::IfAddr::V6(_) => None,
            })
            .collect()
    }
}

impl AddressDiscovery for InterfaceDiscovery {
    fn external_ip(&self) -> Option<IpAddr> {
        Self::interface_nets()
            .into_iter()
            .map(|net| net.addr())
            .find(|ip| is_globally_routable(*ip))
            .map(IpAddr::V4)
    }

    fn local_networks(&self) -> Vec<IpNet> {
        let mut nets: Vec<IpNet> = Self::interface_nets()
            .into_iter()
            .map(|net| IpNet::V4(net.trunc()))
            .collect();
        nets.sort();
        nets.dedup();
        nets
    }
}

/// Fixed addressing, for configuration overrides and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticDiscovery {
    pub external_ip: Option<IpAddr>,
    pub local_networks: Vec<IpNet>,
}

impl AddressDiscovery for StaticDiscovery {
    fn external_ip(&self) -> Option<IpAddr> {
        self.external_ip
    }

    fn local_networks(&self) -> Vec<IpNet> {
        self.local_networks.clone()
    }
}

fn is_globally_routable(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let shared_space = a == 100 && (b & 0xc0) == 64;
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || shared_space)
}

/// Classifies callers and rewrites loopback endpoints.
#[derive(Clone, Debug, Default)]
pub struct AddressLocalizer {
    external_ip: Option<IpAddr>,
    local_networks: Vec<IpNet>,
}

impl AddressLocalizer {
    pub fn new(external_ip: Option<IpAddr>, local_networks: Vec<IpNet>) -> Self {
        Self {
            external_ip,
            local_networks,
        }
    }

    pub fn from_discovery(discovery: &dyn AddressDiscovery) -> Self {
        Self::new(discovery.external_ip(), discovery.local_networks())
    }

    pub fn external_ip(&self) -> Option<IpAddr> {
        self.external_ip
    }

    pub fn local_networks(&self) -> &[IpNet] {
        &self.local_networks
    }

    /// Address an external caller should use to reach `endpoint`.
    ///
    /// Only loopback hosts are rewritten, and only when the external address
    /// is known. The port is always kept.
    pub fn localize(&self, endpoint: SocketAddr) -> SocketAddr {
        match self.external_ip {
            Some(external) if canonical_ip(endpoint.ip()).is_loopback() => {
                SocketAddr::new(external, endpoint.port())
            }
            _ => endpoint,
        }
    }

    /// True if `caller` shares a network with this host and should be given
    /// the announced addresses.
    pub fn is_local(&self, caller: IpAddr) -> bool {
        let caller = canonical_ip(caller);
        caller.is_loopback() || self.local_networks.iter().any(|net| net.contains(&caller))
    }
}
