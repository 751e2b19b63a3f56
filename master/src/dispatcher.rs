//! Routing of inbound datagrams.

use crate::config::{Settings, SettingsHandle};
use crate::registry::{Registration, RegistrationError, Registry};
use crate::stats::ClientStats;
use async_trait::async_trait;
use log::{error, info, warn};
use shared::{build_server_list, decode, MasterHeader, Packet, ServerEntry};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Where list responses go. The listening socket in production.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<()>;
}

#[async_trait]
impl ResponseSink for UdpSocket {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, data, target).await.map(|_| ())
    }
}

/// Drops a datagram identical to the one immediately before it.
///
/// After a drop the memory is cleared, so a third identical datagram in a row
/// is processed again.
#[derive(Debug, Default)]
pub struct Deduplicator {
    previous: Option<(SocketAddr, Vec<u8>)>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the datagram should be processed.
    pub fn admit(&mut self, source: SocketAddr, data: &[u8]) -> bool {
        let duplicate = matches!(
            &self.previous,
            Some((addr, bytes)) if *addr == source && bytes.as_slice() == data
        );
        if duplicate {
            self.previous = None;
            false
        } else {
            self.previous = Some((source, data.to_vec()));
            true
        }
    }
}

/// What happened to one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Malformed,
    /// From a banned network and not a list query.
    BannedDropped,
    /// List query from a banned network, answered with the ban message.
    BannedAnswered,
    Registered(Registration),
    Rejected,
    /// List sent; `servers` entries over `pages` datagrams.
    ListSent { servers: usize, pages: usize },
    SendFailed,
    Unsolicited,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    settings: Arc<SettingsHandle>,
    sink: Arc<dyn ResponseSink>,
    stats: Arc<ClientStats>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        settings: Arc<SettingsHandle>,
        sink: Arc<dyn ResponseSink>,
        stats: Arc<ClientStats>,
    ) -> Self {
        Self {
            registry,
            settings,
            sink,
            stats,
        }
    }

    /// Handles one datagram from `source`.
    pub async fn dispatch(&self, source: SocketAddr, data: &[u8]) -> Disposition {
        let settings = self.settings.current();

        let packet = match decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(target: "master", "[{}] dropping packet: {}", source, e);
                return Disposition::Malformed;
            }
        };

        if let Some(network) = settings.ban.matching(source.ip()) {
            let kind = packet.kind();
            return match packet {
                Packet::ServerListQuery { key } => {
                    warn!(
                        target: "banned",
                        "[{}] {} from banned network {}, sending ban message",
                        source,
                        kind,
                        network
                    );
                    let header = settings.banned_header();
                    self.send_list(source, key, &header, &[], &settings).await;
                    Disposition::BannedAnswered
                }
                _ => {
                    warn!(
                        target: "banned",
                        "[{}] {} from banned network {}, dropping",
                        source,
                        kind,
                        network
                    );
                    Disposition::BannedDropped
                }
            };
        }

        match packet {
            Packet::Heartbeat => {
                match self.registry.register_heartbeat(source, source).await {
                    Ok(registration) => Disposition::Registered(registration),
                    Err(RegistrationError::Verification(_)) | Err(RegistrationError::Quota(_)) => {
                        Disposition::Rejected
                    }
                }
            }
            Packet::ServerListQuery { key } => {
                self.stats.record_client(source.ip());
                let local = settings.localizer.is_local(source.ip());
                let servers = if local {
                    self.registry.local_view()
                } else {
                    self.registry.main_view()
                };
                info!(
                    target: "master",
                    "[{}] sending {} list with {} servers",
                    source,
                    if local { "local" } else { "main" },
                    servers.len()
                );
                self.send_list(source, key, &settings.header(), &servers, &settings)
                    .await
            }
            other => {
                warn!(target: "master", "[{}] unsolicited {} packet", source, other.kind());
                Disposition::Unsolicited
            }
        }
    }

    async fn send_list(
        &self,
        target: SocketAddr,
        key: u16,
        header: &MasterHeader,
        servers: &[ServerEntry],
        settings: &Settings,
    ) -> Disposition {
        let pages = match build_server_list(key, header, servers, settings.max_packet_size()) {
            Ok(pages) => pages,
            Err(e) => {
                error!(target: "master", "[{}] unable to build server list: {}", target, e);
                return Disposition::SendFailed;
            }
        };
        for page in &pages {
            if let Err(e) = self.sink.send_to(page, target).await {
                error!(target: "master", "[{}] failed to send list page: {}", target, e);
                return Disposition::SendFailed;
            }
        }
        Disposition::ListSent {
            servers: servers.len(),
            pages: pages.len(),
        }
    }
}
