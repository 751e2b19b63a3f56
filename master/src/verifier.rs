//! Active liveness probing of game servers.
//!
//! A heartbeat only claims that a server exists. Before the registry trusts
//! it, the master asks the claimed endpoint for its info and waits for a
//! matching answer. No lock is held while a probe is in flight.

use crate::error::VerifyError;
use async_trait::async_trait;
use log::{debug, info};
use shared::{decode, encode, GameInfo, Packet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

#[async_trait]
pub trait LivenessVerifier: Send + Sync {
    /// Probes `endpoint`, giving up after `timeout`.
    async fn verify(&self, endpoint: SocketAddr, timeout: Duration) -> Result<GameInfo, VerifyError>;
}

/// Probes over UDP with a `PingInfoQuery` from a fresh ephemeral socket.
#[derive(Debug, Clone)]
pub struct UdpVerifier {
    buffer_size: usize,
    verbose: bool,
}

impl UdpVerifier {
    pub fn new(buffer_size: usize, verbose: bool) -> Self {
        Self {
            buffer_size,
            verbose,
        }
    }

    async fn exchange(&self, endpoint: SocketAddr) -> Result<GameInfo, VerifyError> {
        let bind_addr = if endpoint.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await.map_err(VerifyError::Local)?;
        socket.connect(endpoint).await.map_err(VerifyError::Local)?;

        let key: u16 = rand::random();
        socket.send(&encode(&Packet::PingInfoQuery { key })?).await?;

        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            let len = socket.recv(&mut buffer).await?;
            match decode(&buffer[..len]) {
                Ok(Packet::PingInfo { key: reply, info }) if reply == key => return Ok(info),
                Ok(other) => debug!("[{}] ignoring {} while probing", endpoint, other.kind()),
                Err(e) => debug!("[{}] ignoring undecodable probe reply: {}", endpoint, e),
            }
        }
    }
}

#[async_trait]
impl LivenessVerifier for UdpVerifier {
    async fn verify(&self, endpoint: SocketAddr, timeout: Duration) -> Result<GameInfo, VerifyError> {
        if self.verbose {
            info!("[{}] probing server", endpoint);
        }
        let info = tokio::time::timeout(timeout, self.exchange(endpoint))
            .await
            .map_err(|_| VerifyError::Timeout(timeout))??;
        if self.verbose {
            info!(
                "[{}] probe answered: {} ({}/{} players)",
                endpoint, info.name, info.player_count, info.max_players
            );
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_server(reply_with_wrong_key: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            if let Ok(Packet::PingInfoQuery { key }) = decode(&buf[..len]) {
                let key = if reply_with_wrong_key { key.wrapping_add(1) } else { key };
                let reply = Packet::PingInfo {
                    key,
                    info: GameInfo {
                        name: "probe target".to_string(),
                        game: "base".to_string(),
                        player_count: 3,
                        max_players: 8,
                    },
                };
                socket.send_to(&encode(&reply).unwrap(), from).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_verify_live_server() {
        let addr = fake_server(false).await;
        let verifier = UdpVerifier::new(2048, false);

        let info = verifier.verify(addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(info.player_count, 3);
        assert_eq!(info.name, "probe target");
    }

    #[tokio::test]
    async fn test_verify_ignores_reply_for_other_key() {
        let addr = fake_server(true).await;
        let verifier = UdpVerifier::new(2048, false);

        let result = verifier.verify(addr, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(VerifyError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_verify_silent_endpoint_times_out() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let verifier = UdpVerifier::new(2048, true);

        let result = verifier
            .verify(silent.local_addr().unwrap(), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(VerifyError::Timeout(_))));
    }
}
