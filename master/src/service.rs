//! Wiring of the master's components and the read-only status snapshot.

use crate::config::{Config, ConfigError, Settings, SettingsHandle};
use crate::dispatcher::Dispatcher;
use crate::federation::{PeerQuerier, PollResult, Poller};
use crate::localizer::AddressDiscovery;
use crate::maintenance::Sweeper;
use crate::network::{Lifecycle, LifecycleStatus, MasterServer};
use crate::registry::{Registry, ViewEntry};
use crate::stats::ClientStats;
use crate::verifier::LivenessVerifier;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Everything an admin or status surface may read. Never used to mutate.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub lifecycle: LifecycleStatus,
    pub main: Vec<ViewEntry>,
    pub local: Vec<ViewEntry>,
    pub servers_with_players: usize,
    pub quota: BTreeMap<IpAddr, u16>,
    pub daily_clients: usize,
    /// `None` when federation is disabled.
    pub poll: Option<PollResult>,
}

pub struct MasterService {
    settings: Arc<SettingsHandle>,
    registry: Arc<Registry>,
    stats: Arc<ClientStats>,
    dispatcher: Arc<Dispatcher>,
    sweeper: Arc<Sweeper>,
    poller: Option<Arc<Poller>>,
    lifecycle: Arc<Lifecycle>,
}

impl MasterService {
    /// Builds the service around a bound `server`.
    ///
    /// Federation exists only when a `querier` is supplied.
    pub fn new(
        settings: Arc<SettingsHandle>,
        server: &MasterServer,
        verifier: Arc<dyn LivenessVerifier>,
        querier: Option<Arc<dyn PeerQuerier>>,
    ) -> Self {
        let registry = Arc::new(Registry::new(verifier, Arc::clone(&settings)));
        let stats = Arc::new(ClientStats::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&settings),
            server.socket(),
            Arc::clone(&stats),
        ));
        let sweeper = Arc::new(Sweeper::new(Arc::clone(&registry), Arc::clone(&settings)));
        let poller = querier.map(|querier| {
            Arc::new(Poller::new(
                querier,
                Arc::clone(&registry),
                Arc::clone(&settings),
            ))
        });

        Self {
            settings,
            registry,
            stats,
            dispatcher,
            sweeper,
            poller,
            lifecycle: server.lifecycle(),
        }
    }

    pub fn settings(&self) -> Arc<SettingsHandle> {
        Arc::clone(&self.settings)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn sweeper(&self) -> Arc<Sweeper> {
        Arc::clone(&self.sweeper)
    }

    pub fn poller(&self) -> Option<Arc<Poller>> {
        self.poller.clone()
    }

    /// Builds a new settings generation from `config` and swaps it in.
    /// On error the current generation stays in force.
    ///
    /// A lowered `servers_per_ip` applies to new registrations only.
    pub fn reload(
        &self,
        config: Config,
        discovery: Option<&dyn AddressDiscovery>,
    ) -> Result<(), ConfigError> {
        let settings = Settings::build(config, discovery)?;
        let limit = settings.servers_per_ip();
        self.settings.replace(settings);
        info!(target: "master", "configuration reloaded");

        for (ip, count) in self.registry.quota_over(limit) {
            warn!(
                target: "registration",
                "IP {} has {} servers, above the new limit of {}; they stay until evicted",
                ip, count, limit
            );
        }
        Ok(())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let registry = self.registry.snapshot();
        let servers_with_players = registry
            .local
            .iter()
            .filter(|entry| entry.info.player_count > 0)
            .count();

        StatusSnapshot {
            lifecycle: self.lifecycle.get(),
            main: registry.main,
            local: registry.local,
            servers_with_players,
            quota: registry.quota,
            daily_clients: self.stats.daily_clients(),
            poll: self.poller.as_ref().map(|poller| (*poller.latest()).clone()),
        }
    }
}
