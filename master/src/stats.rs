//! Daily client statistics.

use crate::utils::canonical_ip;
use log::info;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

/// Unique hosts that asked for a server list since the last daily reset.
#[derive(Debug, Default)]
pub struct ClientStats {
    clients: Mutex<HashSet<IpAddr>>,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_client(&self, ip: IpAddr) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(canonical_ip(ip));
    }

    pub fn daily_clients(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Starts a new day, returning the count for the day that ended.
    pub fn reset_daily(&self) -> usize {
        let previous = {
            let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *clients)
        };
        info!(target: "stats", "{} unique clients since last reset", previous.len());
        previous.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_counted_once_per_host() {
        let stats = ClientStats::new();
        stats.record_client("203.0.113.1".parse().unwrap());
        stats.record_client("203.0.113.1".parse().unwrap());
        stats.record_client("::ffff:203.0.113.1".parse().unwrap());
        stats.record_client("203.0.113.2".parse().unwrap());
        assert_eq!(stats.daily_clients(), 2);
    }

    #[test]
    fn test_reset_starts_new_day() {
        let stats = ClientStats::new();
        stats.record_client("203.0.113.1".parse().unwrap());
        assert_eq!(stats.reset_daily(), 1);
        assert_eq!(stats.daily_clients(), 0);
        assert_eq!(stats.reset_daily(), 0);
    }
}
