//! # Master Server Library
//!
//! A master server keeps the list of game servers that are currently up and
//! hands it to players looking for a game. Game servers announce themselves
//! with a heartbeat; the master never takes that at face value and probes the
//! announced endpoint before listing it.
//!
//! ## Core Responsibilities
//!
//! ### Registry
//! Holds one record per verified game server together with per-IP counts.
//! A server is listed only after answering a probe, each source IP may hold
//! a bounded number of servers, and records past their TTL are re-probed
//! and dropped if they no longer answer.
//!
//! ### Dispatch
//! Every inbound datagram is decoded, checked against the banned networks
//! and routed: heartbeats go to the registry, list queries get the list
//! back in as many pages as needed. An identical datagram repeated back to
//! back from the same source is handled once.
//!
//! ### Federation
//! Optionally polls other masters and registers the servers they know
//! about, after probing each one like a direct heartbeat.
//!
//! ### Address Localization
//! Servers on the master's own host announce from loopback. Callers outside
//! the master's networks get those servers under the master's external
//! address; callers on its networks get the announced address.
//!
//! ## Module Organization
//!
//! - `config`: TOML configuration and immutable settings generations
//! - `ban`, `quota`, `localizer`: the in-memory policy pieces
//! - `verifier`: liveness probing of game servers
//! - `registry`: verified servers and quota, under one lock
//! - `dispatcher`: per-datagram routing and de-duplication
//! - `network`: the UDP receive loop
//! - `maintenance`: TTL sweeps and the daily statistics reset
//! - `federation`: polling peer masters
//! - `service`: wiring and the read-only status snapshot
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use master::config::{Config, Settings, SettingsHandle};
//! use master::network::MasterServer;
//! use master::service::MasterService;
//! use master::verifier::UdpVerifier;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let settings = Arc::new(SettingsHandle::new(Settings::build(config.clone(), None)?));
//!     let current = settings.current();
//!
//!     let server = MasterServer::bind(&config.listen_addr(), current.max_buffer_size()).await?;
//!     let verifier = Arc::new(UdpVerifier::new(current.max_buffer_size(), current.verbose()));
//!     let service = MasterService::new(settings, &server, verifier, None);
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     server.run(service.dispatcher(), shutdown_rx).await;
//!     Ok(())
//! }
//! ```

pub mod ban;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod federation;
pub mod localizer;
pub mod maintenance;
pub mod network;
pub mod quota;
pub mod registry;
pub mod service;
pub mod stats;
pub mod utils;
pub mod verifier;
