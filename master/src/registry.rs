//! The server registry: every game server this master currently vouches for.
//!
//! Records and per-IP quota counts live behind a single mutex so that adding
//! or removing a record and adjusting its quota are one atomic step. Liveness
//! probes are network round-trips and always run with the lock released:
//!
//! 1. Probe the endpoint (no lock).
//! 2. Take the lock, re-read the record, apply the outcome, release.
//!
//! Probes share one semaphore, so heartbeat floods, sweeps and large peer
//! lists together never have more than `max_concurrent_probes` sockets open.
//!
//! A record only ever exists after at least one successful probe, and the two
//! views handed to callers are derived from the same record set under the same
//! lock, so an endpoint is in the main view exactly when it is in the local
//! view.

use crate::config::SettingsHandle;
use crate::error::VerifyError;
use crate::quota::{QuotaExceeded, QuotaTracker};
use crate::utils::{canonical_ip, get_timestamp};
use crate::verifier::LivenessVerifier;
use log::{info, warn};
use serde::Serialize;
use shared::{GameInfo, ServerEntry};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// One verified game server.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    /// Address the server announced from; the registry key.
    pub endpoint: SocketAddr,
    /// IP charged against the quota for this record.
    pub source_ip: IpAddr,
    /// Last accepted heartbeat or successful probe.
    pub last_seen: Instant,
    /// Start of the most recent probe attempt.
    pub solicited_at: Instant,
    /// Wall-clock form of `last_seen`, for display.
    pub last_seen_ms: u64,
    pub info: GameInfo,
}

impl ServerRecord {
    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First successful heartbeat; `ip_count` is the new quota count.
    Created { ip_count: u16 },
    /// Known server; `delta` is the time since it was last seen.
    Refreshed { delta: Duration },
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("verification failed: {0}")]
    Verification(#[from] VerifyError),
    #[error(transparent)]
    Quota(#[from] QuotaExceeded),
}

/// Result of a maintenance check on one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Past TTL and the probe failed; the record and its quota slot are gone.
    Evicted,
    /// Past TTL but the probe succeeded; timestamps refreshed.
    Alive,
    /// Within TTL; not probed.
    Fresh,
    /// Past TTL but the probe could not be sent; kept for the next sweep.
    Deferred,
}

/// A server as presented in a view, with bookkeeping for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewEntry {
    /// Address presented to the caller of this view.
    pub address: SocketAddr,
    /// Address the server announced from.
    pub endpoint: SocketAddr,
    pub info: GameInfo,
    pub last_seen_ms: u64,
}

/// Read-only copy of the registry for status output.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub main: Vec<ViewEntry>,
    pub local: Vec<ViewEntry>,
    pub quota: BTreeMap<IpAddr, u16>,
}

#[derive(Debug, Default)]
struct RegistryState {
    records: HashMap<SocketAddr, ServerRecord>,
    quota: QuotaTracker,
}

pub struct Registry {
    state: Mutex<RegistryState>,
    verifier: Arc<dyn LivenessVerifier>,
    probes: Semaphore,
    settings: Arc<SettingsHandle>,
}

impl Registry {
    pub fn new(verifier: Arc<dyn LivenessVerifier>, settings: Arc<SettingsHandle>) -> Self {
        let probes = Semaphore::new(settings.current().max_concurrent_probes());
        Self {
            state: Mutex::new(RegistryState::default()),
            verifier,
            probes,
            settings,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one liveness probe once a slot is free.
    async fn probe(
        &self,
        endpoint: SocketAddr,
        timeout: Duration,
    ) -> Result<GameInfo, VerifyError> {
        // The semaphore is never closed, so acquiring only waits.
        let _permit = self.probes.acquire().await.ok();
        self.verifier.verify(endpoint, timeout).await
    }

    /// Verifies `endpoint` and, if it answers, creates or refreshes its record.
    ///
    /// `source` is the address the announcement came from; its IP is charged
    /// against the per-IP cap when a new record is created. Nothing is created
    /// or touched when the probe fails or the cap is reached.
    pub async fn register_heartbeat(
        &self,
        source: SocketAddr,
        endpoint: SocketAddr,
    ) -> Result<Registration, RegistrationError> {
        let settings = self.settings.current();
        let solicited_at = Instant::now();

        let info = match self.probe(endpoint, settings.verification_timeout()).await {
            Ok(info) => info,
            Err(e) => {
                warn!(target: "heartbeat", "[{}] error during server verification [{}]", endpoint, e);
                return Err(e.into());
            }
        };

        let now = Instant::now();
        let mut state = self.state();

        if let Some(record) = state.records.get_mut(&endpoint) {
            let delta = now.saturating_duration_since(record.last_seen);
            record.last_seen = now;
            record.solicited_at = solicited_at;
            record.last_seen_ms = get_timestamp();
            record.info = info;
            info!(target: "heartbeat", "[{}] heartbeat - delta: {:?}", endpoint, delta);
            return Ok(Registration::Refreshed { delta });
        }

        let source_ip = canonical_ip(source.ip());
        let limit = settings.servers_per_ip();
        let ip_count = match state.quota.try_acquire(source_ip, limit) {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    target: "registration",
                    "[{}] rejecting additional server for IP {} - count: {}/{}",
                    endpoint, source_ip, e.count, e.limit
                );
                return Err(e.into());
            }
        };

        state.records.insert(
            endpoint,
            ServerRecord {
                endpoint,
                source_ip,
                last_seen: now,
                solicited_at,
                last_seen_ms: get_timestamp(),
                info,
            },
        );
        info!(
            target: "registration",
            "[{}] new server for IP {} - total server count for IP: {}/{}",
            endpoint, source_ip, ip_count, limit
        );
        Ok(Registration::Created { ip_count })
    }

    /// Maintenance check for one endpoint.
    ///
    /// Records within TTL are left alone. Older records are probed; a record
    /// that answers is refreshed, one that does not is removed together with
    /// its quota slot. A probe that failed on this side proves nothing about
    /// the server, so the record stays. Returns `None` when the endpoint is
    /// not registered.
    pub async fn check_and_maybe_evict(&self, endpoint: SocketAddr) -> Option<SweepOutcome> {
        let settings = self.settings.current();
        let ttl = settings.server_ttl();

        let solicited_at = Instant::now();
        {
            let mut state = self.state();
            let record = state.records.get_mut(&endpoint)?;
            if !record.is_expired(ttl, solicited_at) {
                return Some(SweepOutcome::Fresh);
            }
            record.solicited_at = solicited_at;
        }

        let probe = self.probe(endpoint, settings.verification_timeout()).await;

        let now = Instant::now();
        let mut state = self.state();
        match probe {
            Ok(info) => {
                let record = state.records.get_mut(&endpoint)?;
                record.last_seen = now;
                record.last_seen_ms = get_timestamp();
                record.info = info;
                Some(SweepOutcome::Alive)
            }
            Err(VerifyError::Local(e)) => {
                state.records.get(&endpoint)?;
                warn!(
                    target: "maintenance",
                    "unable to probe server {} ({}), keeping it until the next sweep",
                    endpoint, e
                );
                Some(SweepOutcome::Deferred)
            }
            Err(e) => {
                let record = state.records.get(&endpoint)?;
                // A heartbeat may have refreshed it while the probe was out.
                if !record.is_expired(ttl, now) {
                    return Some(SweepOutcome::Alive);
                }
                let record = state.records.remove(&endpoint)?;
                let remaining = state.quota.release(record.source_ip);
                info!(
                    target: "maintenance",
                    "removing server {}, last seen {:?} ago ({}), new count for ip {}: {}",
                    endpoint,
                    now.saturating_duration_since(record.last_seen),
                    e,
                    record.source_ip,
                    remaining
                );
                Some(SweepOutcome::Evicted)
            }
        }
    }

    /// Registers servers reported by peer masters.
    ///
    /// Endpoints already known are skipped. Each new one goes through the same
    /// probe and quota path as a heartbeat, charged to its own IP. Returns the
    /// number of servers newly registered.
    pub async fn register_external(self: &Arc<Self>, endpoints: &[SocketAddr]) -> usize {
        let unknown: Vec<SocketAddr> = {
            let state = self.state();
            endpoints
                .iter()
                .filter(|endpoint| !state.records.contains_key(endpoint))
                .copied()
                .collect()
        };
        info!(
            target: "poll",
            "registering {} servers from external list ({} already known)",
            unknown.len(),
            endpoints.len() - unknown.len()
        );

        let mut probes = JoinSet::new();
        for endpoint in unknown {
            let registry = Arc::clone(self);
            probes.spawn(async move { registry.register_heartbeat(endpoint, endpoint).await });
        }

        let mut registered = 0;
        while let Some(result) = probes.join_next().await {
            if let Ok(Ok(Registration::Created { .. })) = result {
                registered += 1;
            }
        }
        registered
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.state().records.keys().copied().collect()
    }

    pub fn contains(&self, endpoint: SocketAddr) -> bool {
        self.state().records.contains_key(&endpoint)
    }

    pub fn get(&self, endpoint: SocketAddr) -> Option<ServerRecord> {
        self.state().records.get(&endpoint).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    pub fn quota_for(&self, ip: IpAddr) -> u16 {
        self.state().quota.count(canonical_ip(ip))
    }

    /// IPs with more registered servers than `limit`.
    pub fn quota_over(&self, limit: u16) -> BTreeMap<IpAddr, u16> {
        self.state().quota.over_limit(limit)
    }

    /// Servers as external callers should reach them.
    pub fn main_view(&self) -> Vec<ServerEntry> {
        let localizer = self.settings.current().localizer.clone();
        self.view(|endpoint| localizer.localize(endpoint))
    }

    /// Servers as they announced themselves.
    pub fn local_view(&self) -> Vec<ServerEntry> {
        self.view(|endpoint| endpoint)
    }

    fn view(&self, present: impl Fn(SocketAddr) -> SocketAddr) -> Vec<ServerEntry> {
        let state = self.state();
        let mut entries: Vec<ServerEntry> = state
            .records
            .values()
            .map(|record| ServerEntry {
                addr: present(record.endpoint),
                info: record.info.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.addr);
        entries
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let localizer = self.settings.current().localizer.clone();
        let state = self.state();

        let mut local: Vec<ViewEntry> = state
            .records
            .values()
            .map(|record| ViewEntry {
                address: record.endpoint,
                endpoint: record.endpoint,
                info: record.info.clone(),
                last_seen_ms: record.last_seen_ms,
            })
            .collect();
        local.sort_by_key(|entry| entry.endpoint);

        let main = local
            .iter()
            .map(|entry| ViewEntry {
                address: localizer.localize(entry.endpoint),
                ..entry.clone()
            })
            .collect();

        RegistrySnapshot {
            main,
            local,
            quota: state.quota.to_map(),
        }
    }
}
