//! Master network layer: the UDP receive loop and its lifecycle

use crate::dispatcher::{Deduplicator, Dispatcher};
use crate::error::MasterError;
use log::{debug, error, info};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// State of the receive loop, as reported in status snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleStatus {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug)]
pub struct Lifecycle {
    status: Mutex<LifecycleStatus>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(LifecycleStatus::Stopped),
        }
    }

    pub fn get(&self) -> LifecycleStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, status: LifecycleStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the receive loop ended
#[derive(Debug)]
pub enum LoopExit {
    /// Shutdown was requested; not an error.
    Shutdown,
    /// The socket failed.
    Failed(io::Error),
}

/// Owns the listening socket and feeds datagrams to the dispatcher
pub struct MasterServer {
    socket: Arc<UdpSocket>,
    lifecycle: Arc<Lifecycle>,
    buffer_size: usize,
}

impl MasterServer {
    pub async fn bind(addr: &str, buffer_size: usize) -> Result<Self, MasterError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| MasterError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!(target: "master", "master listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            lifecycle: Arc::new(Lifecycle::new()),
            buffer_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The listening socket, also used to send list responses.
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Receives until `shutdown` flips or the socket fails.
    ///
    /// Each datagram that passes de-duplication is handled on its own task,
    /// so a slow probe never holds up the next datagram.
    pub async fn run(
        &self,
        dispatcher: Arc<Dispatcher>,
        mut shutdown: watch::Receiver<bool>,
    ) -> LoopExit {
        self.lifecycle.set(LifecycleStatus::Running);
        info!(target: "master", "master started successfully");

        let mut dedup = Deduplicator::new();
        let mut buffer = vec![0u8; self.buffer_size];

        let exit = loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, source)) => {
                            let data = &buffer[..len];
                            if !dedup.admit(source, data) {
                                debug!(target: "master", "[{}] dropping duplicate packet", source);
                                continue;
                            }
                            let data = data.to_vec();
                            let dispatcher = Arc::clone(&dispatcher);
                            tokio::spawn(async move {
                                dispatcher.dispatch(source, &data).await;
                            });
                        }
                        // ICMP unreachable from an earlier send; the socket is fine.
                        Err(e) if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                        ) => {
                            debug!(target: "master", "ignoring receive error: {}", e);
                        }
                        Err(e) => {
                            error!(target: "master", "error receiving packet: {}", e);
                            break LoopExit::Failed(e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    self.lifecycle.set(LifecycleStatus::Stopping);
                    info!(target: "master", "master shutting down");
                    break LoopExit::Shutdown;
                }
            }
        };

        self.lifecycle.set(LifecycleStatus::Stopped);
        exit
    }
}
