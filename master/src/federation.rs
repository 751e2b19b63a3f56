//! Federation with peer masters.
//!
//! Each poll asks every known master for its list, merges what came back and
//! publishes the result as one immutable [`PollResult`]. Servers learned this
//! way are not trusted: unknown ones go through the same probe and quota path
//! as a direct heartbeat. Peers never remove anything from the registry;
//! stale federated servers age out through the normal maintenance sweep.

use crate::config::SettingsHandle;
use crate::error::PeerError;
use crate::registry::Registry;
use crate::utils::get_timestamp;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use shared::{decode, encode, ListAssembler, MasterHeader, Packet, ServerEntry};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};

/// What one peer master said about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    /// The configured name, as `host:port`.
    pub peer: String,
    pub address: SocketAddr,
    pub header: MasterHeader,
    pub server_count: usize,
    pub pages_received: usize,
    pub pages_expected: usize,
}

#[derive(Debug, Clone)]
pub struct PeerListing {
    pub summary: PeerSummary,
    pub servers: Vec<ServerEntry>,
}

/// Outcome of one poll cycle. Replaced whole, never edited.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollResult {
    pub masters: Vec<PeerSummary>,
    /// Union of every server reported, one entry per address.
    pub games: Vec<ServerEntry>,
    pub errors: Vec<String>,
    pub polled_at_ms: u64,
}

#[async_trait]
pub trait PeerQuerier: Send + Sync {
    async fn query(&self, peer: &str, timeout: Duration) -> Result<PeerListing, PeerError>;
}

/// Queries peers with `ServerListQuery` over UDP.
#[derive(Debug, Clone)]
pub struct UdpPeerQuerier {
    buffer_size: usize,
}

impl UdpPeerQuerier {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    async fn resolve(peer: &str, deadline: Instant) -> Result<SocketAddr, PeerError> {
        let unresolved = || PeerError::Unresolved {
            peer: peer.to_string(),
        };
        let mut addrs = timeout_at(deadline, lookup_host(peer))
            .await
            .map_err(|_| unresolved())?
            .map_err(|_| unresolved())?;
        addrs.next().ok_or_else(unresolved)
    }
}

#[async_trait]
impl PeerQuerier for UdpPeerQuerier {
    async fn query(&self, peer: &str, timeout: Duration) -> Result<PeerListing, PeerError> {
        let deadline = Instant::now() + timeout;
        let io_error = |source| PeerError::Io {
            peer: peer.to_string(),
            source,
        };

        let address = Self::resolve(peer, deadline).await?;
        let bind_addr = if address.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await.map_err(io_error)?;
        socket.connect(address).await.map_err(io_error)?;

        let key: u16 = rand::random();
        let query = encode(&Packet::ServerListQuery { key }).map_err(|source| PeerError::Codec {
            peer: peer.to_string(),
            source,
        })?;
        socket.send(&query).await.map_err(io_error)?;

        let mut assembler = ListAssembler::new(key);
        let mut buffer = vec![0u8; self.buffer_size];
        let mut expected = 0usize;
        while !assembler.is_complete() {
            let len = match timeout_at(deadline, socket.recv(&mut buffer)).await {
                Ok(received) => received.map_err(io_error)?,
                Err(_) => break,
            };
            match decode(&buffer[..len]) {
                Ok(packet) => {
                    if let Packet::ServerList { pages, .. } = &packet {
                        expected = expected.max(*pages as usize);
                    }
                    if !assembler.accept(packet) {
                        debug!(target: "poll", "[{}] ignoring unrelated packet", peer);
                    }
                }
                Err(e) => debug!(target: "poll", "[{}] ignoring undecodable reply: {}", peer, e),
            }
        }

        let pages_received = assembler.received_pages();
        if pages_received > 0 && !assembler.is_complete() {
            warn!(
                target: "poll",
                "[{}] only {}/{} list pages arrived, using partial list",
                peer, pages_received, expected
            );
        }
        let (header, servers) = assembler.finish().ok_or_else(|| PeerError::Timeout {
            peer: peer.to_string(),
            timeout,
        })?;

        Ok(PeerListing {
            summary: PeerSummary {
                peer: peer.to_string(),
                address,
                header,
                server_count: servers.len(),
                pages_received,
                pages_expected: expected,
            },
            servers,
        })
    }
}

pub struct Poller {
    querier: Arc<dyn PeerQuerier>,
    registry: Arc<Registry>,
    settings: Arc<SettingsHandle>,
    latest: RwLock<Arc<PollResult>>,
}

impl Poller {
    pub fn new(
        querier: Arc<dyn PeerQuerier>,
        registry: Arc<Registry>,
        settings: Arc<SettingsHandle>,
    ) -> Self {
        Self {
            querier,
            registry,
            settings,
            latest: RwLock::new(Arc::new(PollResult::default())),
        }
    }

    /// The most recently published poll result.
    pub fn latest(&self) -> Arc<PollResult> {
        Arc::clone(&self.latest.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Runs one poll cycle: query, merge, publish, then register unknown servers.
    pub async fn poll_once(&self) -> Arc<PollResult> {
        let settings = self.settings.current();
        let timeout = settings.verification_timeout();

        let mut queries = JoinSet::new();
        for peer in settings.known_masters() {
            let querier = Arc::clone(&self.querier);
            let peer = peer.clone();
            queries.spawn(async move { querier.query(&peer, timeout).await });
        }

        let mut masters = Vec::new();
        let mut games: BTreeMap<SocketAddr, ServerEntry> = BTreeMap::new();
        let mut errors = Vec::new();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok(Ok(listing)) => {
                    for server in listing.servers {
                        games.entry(server.addr).or_insert(server);
                    }
                    masters.push(listing.summary);
                }
                Ok(Err(e)) => {
                    warn!(target: "poll", "{}", e);
                    errors.push(e.to_string());
                }
                Err(e) => errors.push(format!("peer query task failed: {}", e)),
            }
        }
        masters.sort_by(|a, b| a.peer.cmp(&b.peer));
        errors.sort();

        let result = Arc::new(PollResult {
            masters,
            games: games.into_values().collect(),
            errors,
            polled_at_ms: get_timestamp(),
        });
        info!(
            target: "poll",
            "found {} games on {} masters",
            result.games.len(),
            result.masters.len()
        );

        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&result);

        let endpoints: Vec<SocketAddr> = result.games.iter().map(|game| game.addr).collect();
        let added = self.registry.register_external(&endpoints).await;
        debug!(target: "poll", "{} federated servers newly registered", added);

        result
    }

    /// Polls immediately, then on the configured interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let settings = self.settings.current();
        info!(target: "poll", "will run every {:?}", settings.poll_interval());
        info!(target: "poll", "known masters are {:?}", settings.known_masters());

        let mut period = settings.poll_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;

                    let current = self.settings.current().poll_interval();
                    if current != period {
                        period = current;
                        ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(target: "poll", "shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{settings_with, MockVerifier};
    use shared::{build_server_list, GameInfo};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn entry(s: &str) -> ServerEntry {
        ServerEntry {
            addr: addr(s),
            info: GameInfo::default(),
        }
    }

    /// Peers answer from a script; a missing peer is unreachable.
    #[derive(Default)]
    struct MockPeers {
        lists: Mutex<HashMap<String, Vec<ServerEntry>>>,
    }

    impl MockPeers {
        fn set(&self, peer: &str, servers: Vec<ServerEntry>) {
            self.lists.lock().unwrap().insert(peer.to_string(), servers);
        }

        fn remove(&self, peer: &str) {
            self.lists.lock().unwrap().remove(peer);
        }
    }

    #[async_trait]
    impl PeerQuerier for MockPeers {
        async fn query(&self, peer: &str, timeout: Duration) -> Result<PeerListing, PeerError> {
            let servers = self.lists.lock().unwrap().get(peer).cloned();
            let servers = servers.ok_or_else(|| PeerError::Timeout {
                peer: peer.to_string(),
                timeout,
            })?;
            Ok(PeerListing {
                summary: PeerSummary {
                    peer: peer.to_string(),
                    address: addr("192.0.2.1:29000"),
                    header: MasterHeader::default(),
                    server_count: servers.len(),
                    pages_received: 1,
                    pages_expected: 1,
                },
                servers,
            })
        }
    }

    struct Fixture {
        poller: Poller,
        peers: Arc<MockPeers>,
        registry: Arc<Registry>,
        verifier: Arc<MockVerifier>,
    }

    fn fixture() -> Fixture {
        let settings = settings_with(|c| {
            c.poll.enabled = true;
            c.poll.known_masters = vec!["alpha:29000".to_string(), "beta:29000".to_string()];
        });
        let verifier = Arc::new(MockVerifier::default());
        let registry = Arc::new(Registry::new(verifier.clone(), settings.clone()));
        let peers = Arc::new(MockPeers::default());
        let poller = Poller::new(peers.clone(), registry.clone(), settings);
        Fixture {
            poller,
            peers,
            registry,
            verifier,
        }
    }

    #[tokio::test]
    async fn test_poll_merges_and_registers_verified_servers() {
        let f = fixture();
        let shared_server = "203.0.113.1:29001";
        f.peers.set("alpha:29000", vec![entry(shared_server), entry("203.0.113.2:29001")]);
        f.peers.set("beta:29000", vec![entry(shared_server), entry("203.0.113.3:29001")]);
        f.verifier.set_alive(addr(shared_server), 1);
        f.verifier.set_alive(addr("203.0.113.3:29001"), 1);

        let result = f.poller.poll_once().await;
        assert_eq!(result.masters.len(), 2);
        assert_eq!(result.games.len(), 3);
        assert!(result.errors.is_empty());

        // Only servers that answered the probe are trusted.
        assert_eq!(f.registry.len(), 2);
        assert!(!f.registry.contains(addr("203.0.113.2:29001")));
        assert!(Arc::ptr_eq(&f.poller.latest(), &result));
    }

    #[tokio::test]
    async fn test_unreachable_peer_isolated_in_errors() {
        let f = fixture();
        f.peers.set("alpha:29000", vec![entry("203.0.113.1:29001")]);
        f.verifier.set_alive(addr("203.0.113.1:29001"), 0);

        let result = f.poller.poll_once().await;
        assert_eq!(result.masters.len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("beta:29000"));
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_poll_is_idempotent() {
        let f = fixture();
        f.peers.set("alpha:29000", vec![entry("203.0.113.1:29001")]);
        f.peers.set("beta:29000", vec![]);
        f.verifier.set_alive(addr("203.0.113.1:29001"), 0);

        f.poller.poll_once().await;
        let calls = f.verifier.calls();
        let quota = f.registry.snapshot().quota;

        f.poller.poll_once().await;
        assert_eq!(f.verifier.calls(), calls);
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.registry.snapshot().quota, quota);
    }

    #[tokio::test]
    async fn test_failed_peer_never_removes_known_servers() {
        let f = fixture();
        f.peers.set("alpha:29000", vec![entry("203.0.113.1:29001")]);
        f.verifier.set_alive(addr("203.0.113.1:29001"), 0);
        f.poller.poll_once().await;

        f.peers.remove("alpha:29000");
        let result = f.poller.poll_once().await;
        assert_eq!(result.errors.len(), 2);
        assert!(result.games.is_empty());
        assert!(f.registry.contains(addr("203.0.113.1:29001")));
    }

    async fn fake_peer(send_pages: usize) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let key = match decode(&buf[..len]) {
                Ok(Packet::ServerListQuery { key }) => key,
                _ => return,
            };
            let servers: Vec<ServerEntry> = (1..=20)
                .map(|port| entry(&format!("203.0.113.7:{}", port)))
                .collect();
            let header = MasterHeader {
                master_id: 7,
                name: "peer".to_string(),
                motd: String::new(),
            };
            let pages = build_server_list(key, &header, &servers, 200).unwrap();
            assert!(pages.len() > 1);
            for page in pages.iter().take(send_pages) {
                socket.send_to(page, from).await.unwrap();
            }
        });
        address
    }

    #[tokio::test]
    async fn test_udp_querier_reassembles_full_list() {
        let peer = fake_peer(usize::MAX).await;
        let querier = UdpPeerQuerier::new(2048);

        let listing = querier
            .query(&peer.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(listing.servers.len(), 20);
        assert_eq!(listing.summary.header.master_id, 7);
        assert_eq!(listing.summary.pages_received, listing.summary.pages_expected);
    }

    #[tokio::test]
    async fn test_udp_querier_accepts_partial_list() {
        let peer = fake_peer(1).await;
        let querier = UdpPeerQuerier::new(2048);

        let listing = querier
            .query(&peer.to_string(), Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(listing.summary.pages_received, 1);
        assert!(listing.summary.pages_expected > 1);
        assert!(!listing.servers.is_empty());
        assert!(listing.servers.len() < 20);
    }

    #[tokio::test]
    async fn test_udp_querier_silent_peer_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let querier = UdpPeerQuerier::new(2048);

        let result = querier
            .query(&silent.local_addr().unwrap().to_string(), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(PeerError::Timeout { .. })));
    }
}
