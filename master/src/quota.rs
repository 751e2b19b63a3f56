//! Per-source-IP count of registered servers.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("server quota exhausted for {ip}: {count}/{limit}")]
pub struct QuotaExceeded {
    pub ip: IpAddr,
    pub count: u16,
    pub limit: u16,
}

/// Counts registered endpoints per source IP.
///
/// An entry exists only while its count is non-zero. The tracker is not
/// synchronised on its own; the registry mutates it under the same lock as
/// the record map.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    counts: HashMap<IpAddr, u16>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one slot for `ip`, returning the new count.
    ///
    /// `limit` only gates new slots. Counts already above a lowered limit
    /// stay until their records are evicted.
    pub fn try_acquire(&mut self, ip: IpAddr, limit: u16) -> Result<u16, QuotaExceeded> {
        let count = self.count(ip);
        if u32::from(count) + 1 > u32::from(limit) {
            return Err(QuotaExceeded { ip, count, limit });
        }
        let count = count + 1;
        self.counts.insert(ip, count);
        Ok(count)
    }

    /// Gives back one slot for `ip`, returning what is left.
    pub fn release(&mut self, ip: IpAddr) -> u16 {
        match self.counts.get_mut(&ip) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                self.counts.remove(&ip);
                0
            }
            None => 0,
        }
    }

    pub fn count(&self, ip: IpAddr) -> u16 {
        self.counts.get(&ip).copied().unwrap_or(0)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.counts.contains_key(&ip)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// IPs holding more slots than `limit` allows.
    pub fn over_limit(&self, limit: u16) -> BTreeMap<IpAddr, u16> {
        self.counts
            .iter()
            .filter(|(_, count)| **count > limit)
            .map(|(ip, count)| (*ip, *count))
            .collect()
    }

    pub fn to_map(&self) -> BTreeMap<IpAddr, u16> {
        self.counts.iter().map(|(ip, count)| (*ip, *count)).collect()
    }
}
