use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use thiserror::Error;

/// First byte of every datagram. Anything else is rejected before bincode sees it.
pub const PROTOCOL_VERSION: u8 = 0x10;
pub const DEFAULT_PORT: u16 = 29000;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 512;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    /// Game server announcing itself; the master probes the source address back.
    Heartbeat,
    ServerListQuery {
        key: u16,
    },
    ServerList {
        key: u16,
        page: u16,
        pages: u16,
        header: MasterHeader,
        servers: Vec<ServerEntry>,
    },
    /// Liveness probe sent by a master to a game server.
    PingInfoQuery {
        key: u16,
    },
    PingInfo {
        key: u16,
        info: GameInfo,
    },
}

impl Packet {
    /// Short label used when logging packet types.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Heartbeat => "heartbeat",
            Packet::ServerListQuery { .. } => "server-list-query",
            Packet::ServerList { .. } => "server-list",
            Packet::PingInfoQuery { .. } => "ping-info-query",
            Packet::PingInfo { .. } => "ping-info",
        }
    }
}

/// What a game server reports about itself when probed.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct GameInfo {
    pub name: String,
    pub game: String,
    pub player_count: u8,
    pub max_players: u8,
}

/// Identity of the master answering a list query.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct MasterHeader {
    pub master_id: u16,
    pub name: String,
    pub motd: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub addr: SocketAddr,
    pub info: GameInfo,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty packet")]
    Empty,
    #[error("unknown protocol version {0:#04x}")]
    UnknownVersion(u8),
    #[error("malformed packet: {0}")]
    Malformed(#[source] bincode::Error),
    #[error("unable to encode packet: {0}")]
    Encode(#[source] bincode::Error),
    #[error("server list needs {0} pages, more than a list response can carry")]
    TooManyPages(usize),
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(packet).map_err(CodecError::Encode)?;
    let mut data = Vec::with_capacity(body.len() + 1);
    data.push(PROTOCOL_VERSION);
    data.extend_from_slice(&body);
    Ok(data)
}

pub fn decode(data: &[u8]) -> Result<Packet, CodecError> {
    let (&version, body) = data.split_first().ok_or(CodecError::Empty)?;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    bincode::deserialize(body).map_err(CodecError::Malformed)
}

/// Splits a server list into as many `ServerList` datagrams as needed to keep
/// each one within `max_packet_size`.
///
/// A page always carries at least one entry, so a single oversized entry still
/// goes out on its own page. An empty list produces exactly one empty page so
/// the caller always gets the header (and MOTD) back.
pub fn build_server_list(
    key: u16,
    header: &MasterHeader,
    entries: &[ServerEntry],
    max_packet_size: usize,
) -> Result<Vec<Vec<u8>>, CodecError> {
    let empty_page = Packet::ServerList {
        key,
        page: 0,
        pages: 0,
        header: header.clone(),
        servers: Vec::new(),
    };
    // Version byte plus the page with no servers; every entry adds its own size.
    let base_len = 1 + bincode::serialized_size(&empty_page).map_err(CodecError::Encode)? as usize;

    let mut pages: Vec<Vec<ServerEntry>> = Vec::new();
    let mut current: Vec<ServerEntry> = Vec::new();
    let mut current_len = base_len;

    for entry in entries {
        let entry_len = bincode::serialized_size(entry).map_err(CodecError::Encode)? as usize;
        if !current.is_empty() && current_len + entry_len > max_packet_size {
            pages.push(std::mem::take(&mut current));
            current_len = base_len;
        }
        current.push(entry.clone());
        current_len += entry_len;
    }
    pages.push(current);

    let total = u16::try_from(pages.len()).map_err(|_| CodecError::TooManyPages(pages.len()))?;

    pages
        .into_iter()
        .enumerate()
        .map(|(page, servers)| {
            encode(&Packet::ServerList {
                key,
                page: page as u16,
                pages: total,
                header: header.clone(),
                servers,
            })
        })
        .collect()
}

/// Reassembles the pages of one list response.
///
/// Pages for other keys and repeated pages are ignored, since datagrams may be
/// duplicated or arrive late from an earlier request.
#[derive(Debug)]
pub struct ListAssembler {
    key: u16,
    header: Option<MasterHeader>,
    total: Option<u16>,
    pages: BTreeMap<u16, Vec<ServerEntry>>,
}

impl ListAssembler {
    pub fn new(key: u16) -> Self {
        Self {
            key,
            header: None,
            total: None,
            pages: BTreeMap::new(),
        }
    }

    /// Feeds one decoded packet. Returns true if it was a page of this response.
    pub fn accept(&mut self, packet: Packet) -> bool {
        match packet {
            Packet::ServerList {
                key,
                page,
                pages,
                header,
                servers,
            } if key == self.key && page < pages => {
                self.total.get_or_insert(pages);
                self.header.get_or_insert(header);
                self.pages.entry(page).or_insert(servers);
                true
            }
            _ => false,
        }
    }

    pub fn received_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.pages.len() >= total as usize)
    }

    /// Returns the header and every entry received so far, in page order.
    pub fn finish(self) -> Option<(MasterHeader, Vec<ServerEntry>)> {
        let header = self.header?;
        let servers = self.pages.into_values().flatten().collect();
        Some((header, servers))
    }
}
