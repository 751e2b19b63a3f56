//! # Master Client Library
//!
//! Client-side tooling for the master server protocol. Both halves of the
//! protocol a master talks to are here, which makes the crate useful for
//! operators and for end-to-end tests alike.
//!
//! ## Module Organization
//!
//! ### Announcer Module (`announcer`)
//! Plays the part of a game server:
//! - Sends heartbeats to a master on an interval
//! - Answers the master's liveness probes with its current game info
//!
//! ### Browser Module (`browser`)
//! Plays the part of a player looking for a game:
//! - Asks a master for its server list
//! - Reassembles the paged response, keeping partial lists when pages go missing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::browser::query_master;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let list = query_master("127.0.0.1:29000", Duration::from_secs(2)).await?;
//!     println!("{}: {} servers", list.header.name, list.servers.len());
//!     Ok(())
//! }
//! ```

pub mod announcer;
pub mod browser;
