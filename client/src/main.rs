use clap::{Parser, Subcommand};
use client::announcer::Announcer;
use client::browser::query_master;
use log::info;
use shared::GameInfo;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Master address to talk to
    #[arg(short = 'm', long, default_value = "127.0.0.1:29000")]
    master: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the master's server list
    Query {
        /// How long to wait for all pages, in milliseconds
        #[arg(short, long, default_value = "2000")]
        timeout: u64,
    },
    /// Run a fake game server that heartbeats the master and answers probes
    Announce {
        /// Address to bind the game server to
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: String,

        #[arg(short, long, default_value = "Test Server")]
        name: String,

        #[arg(short, long, default_value = "0")]
        players: u8,

        /// Seconds between heartbeats
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    match args.command {
        Command::Query { timeout } => {
            let list = query_master(&args.master, Duration::from_millis(timeout)).await?;
            println!(
                "master {} \"{}\" ({} servers{})",
                list.header.master_id,
                list.header.name,
                list.servers.len(),
                if list.complete { "" } else { ", partial" }
            );
            if !list.header.motd.is_empty() {
                println!("{}", list.header.motd);
            }
            for server in &list.servers {
                println!(
                    "{:<22} {:<32} {:<12} {}/{}",
                    server.addr,
                    server.info.name,
                    server.info.game,
                    server.info.player_count,
                    server.info.max_players
                );
            }
        }
        Command::Announce {
            bind,
            name,
            players,
            interval,
        } => {
            let info = GameInfo {
                name,
                game: "base".to_string(),
                player_count: players,
                max_players: 16,
            };
            let announcer = Announcer::bind(&bind, &args.master, info).await?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            tokio::select! {
                _ = announcer.run(Duration::from_secs(interval.max(1)), shutdown_rx) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl+C, stopping");
                    let _ = shutdown_tx.send(true);
                }
            }
            info!("answered {} probes", announcer.probes_answered());
        }
    }

    Ok(())
}
