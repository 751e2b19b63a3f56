use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Time left until the next UTC midnight.
pub fn until_next_midnight() -> Duration {
    const DAY_MS: u64 = 24 * 60 * 60 * 1000;
    let now = get_timestamp();
    Duration::from_millis(DAY_MS - now % DAY_MS)
}

/// Folds IPv4-mapped IPv6 addresses back to IPv4 so that a dual-stack socket
/// and a v4 socket see the same host identity for bans and quotas.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_canonical_ip_unmaps_v4() {
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 5).to_ipv6_mapped());
        assert_eq!(canonical_ip(mapped), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn test_canonical_ip_keeps_native_v6() {
        let ip = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(canonical_ip(ip), ip);
    }

    #[test]
    fn test_until_next_midnight_within_a_day() {
        let wait = until_next_midnight();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(24 * 60 * 60));
    }
}
