//! A scriptable game server that announces itself to a master.

use log::{debug, info, warn};
use shared::{decode, encode, GameInfo, Packet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

pub struct Announcer {
    socket: Arc<UdpSocket>,
    master: SocketAddr,
    info: Mutex<GameInfo>,
    probes_answered: AtomicUsize,
}

impl Announcer {
    pub async fn bind(
        addr: &str,
        master: &str,
        info: GameInfo,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind(addr).await?;
        let master = tokio::net::lookup_host(master)
            .await?
            .next()
            .ok_or("master address did not resolve")?;
        info!("announcing {} from {} to {}", info.name, socket.local_addr()?, master);

        Ok(Self {
            socket: Arc::new(socket),
            master,
            info: Mutex::new(info),
            probes_answered: AtomicUsize::new(0),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_player_count(&self, player_count: u8) {
        if let Ok(mut info) = self.info.lock() {
            info.player_count = player_count;
        }
    }

    pub fn probes_answered(&self) -> usize {
        self.probes_answered.load(Ordering::SeqCst)
    }

    pub async fn send_heartbeat(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.socket
            .send_to(&encode(&Packet::Heartbeat)?, self.master)
            .await?;
        debug!("heartbeat sent to {}", self.master);
        Ok(())
    }

    async fn answer(&self, data: &[u8], from: SocketAddr) {
        let key = match decode(data) {
            Ok(Packet::PingInfoQuery { key }) => key,
            Ok(other) => {
                debug!("ignoring {} from {}", other.kind(), from);
                return;
            }
            Err(e) => {
                debug!("ignoring undecodable packet from {}: {}", from, e);
                return;
            }
        };

        let info = match self.info.lock() {
            Ok(info) => info.clone(),
            Err(_) => return,
        };
        let reply = match encode(&Packet::PingInfo { key, info }) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("unable to encode probe reply: {}", e);
                return;
            }
        };
        match self.socket.send_to(&reply, from).await {
            Ok(_) => {
                self.probes_answered.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => warn!("failed to answer probe from {}: {}", from, e),
        }
    }

    /// Heartbeats every `heartbeat_interval` and answers probes until
    /// `shutdown` flips. The first heartbeat goes out immediately.
    pub async fn run(&self, heartbeat_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buffer = [0u8; 2048];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sent = self.send_heartbeat().await;
                    if let Err(e) = sent {
                        warn!("failed to send heartbeat: {}", e);
                    }
                }
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, from)) => self.answer(&buffer[..len], from).await,
                        Err(e) => {
                            debug!("receive error: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
