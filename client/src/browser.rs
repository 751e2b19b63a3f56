//! Server list retrieval from a master.

use log::{debug, warn};
use shared::{decode, encode, ListAssembler, MasterHeader, Packet, ServerEntry};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

/// A master's answer to one list query.
#[derive(Debug, Clone)]
pub struct ServerList {
    pub header: MasterHeader,
    pub servers: Vec<ServerEntry>,
    /// False if some pages never arrived.
    pub complete: bool,
}

/// Asks `master` for its server list, waiting at most `timeout` for all pages.
pub async fn query_master(
    master: &str,
    timeout: Duration,
) -> Result<ServerList, Box<dyn std::error::Error>> {
    let deadline = Instant::now() + timeout;
    let master = tokio::net::lookup_host(master)
        .await?
        .next()
        .ok_or("master address did not resolve")?;

    let bind_addr = if master.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(master).await?;

    let key: u16 = rand::random();
    socket.send(&encode(&Packet::ServerListQuery { key })?).await?;

    let mut assembler = ListAssembler::new(key);
    let mut buffer = [0u8; 2048];
    while !assembler.is_complete() {
        let len = match timeout_at(deadline, socket.recv(&mut buffer)).await {
            Ok(received) => received?,
            Err(_) => break,
        };
        match decode(&buffer[..len]) {
            Ok(packet) => {
                assembler.accept(packet);
            }
            Err(e) => debug!("ignoring undecodable reply from {}: {}", master, e),
        }
    }

    let complete = assembler.is_complete();
    if !complete && assembler.received_pages() > 0 {
        warn!(
            "{}: only {} list pages arrived",
            master,
            assembler.received_pages()
        );
    }
    let (header, servers) = assembler
        .finish()
        .ok_or_else(|| format!("{}: no response within {:?}", master, timeout))?;

    Ok(ServerList {
        header,
        servers,
        complete,
    })
}
