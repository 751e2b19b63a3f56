use clap::Parser;
use log::{debug, error, info, warn};
use master::config::{Config, Settings, SettingsHandle};
use master::federation::{PeerQuerier, UdpPeerQuerier};
use master::localizer::InterfaceDiscovery;
use master::maintenance::run_daily_reset;
use master::network::{LoopExit, MasterServer};
use master::service::MasterService;
use master::verifier::UdpVerifier;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults apply if it does not exist
    #[arg(short, long, default_value = "master.toml")]
    config: PathBuf,

    /// IP address to bind to, overriding the configuration
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Log at debug level and log every probe
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> Result<Config, master::config::ConfigError> {
        let mut config = Config::load(&self.config)?;
        if let Some(host) = &self.host {
            config.service.listen.ip = host.clone();
        }
        if let Some(port) = self.port {
            config.service.listen.port = port;
        }
        if self.verbose {
            config.advanced.verbose = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = args.load_config()?;
    let settings = Arc::new(SettingsHandle::new(Settings::build(
        config.clone(),
        Some(&InterfaceDiscovery),
    )?));
    let current = settings.current();
    info!(
        target: "master",
        "external address {:?}, local networks {:?}",
        current.localizer.external_ip(),
        current.localizer.local_networks()
    );

    let server = MasterServer::bind(&config.listen_addr(), current.max_buffer_size()).await?;
    let verifier = Arc::new(UdpVerifier::new(current.max_buffer_size(), current.verbose()));
    let querier: Option<Arc<dyn PeerQuerier>> = if config.poll.enabled {
        Some(Arc::new(UdpPeerQuerier::new(current.max_buffer_size())))
    } else {
        info!(target: "poll", "polling disabled");
        None
    };
    let service = Arc::new(MasterService::new(
        Arc::clone(&settings),
        &server,
        verifier,
        querier,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Maintenance sweeps, with the status snapshot after each one
    let sweeper_handle = {
        let service = Arc::clone(&service);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let sweeper = service.sweeper();
            sweeper
                .run(shutdown, |_| {
                    if log::log_enabled!(target: "stats", log::Level::Debug) {
                        match serde_json::to_string(&service.snapshot()) {
                            Ok(json) => debug!(target: "stats", "{}", json),
                            Err(e) => warn!(target: "stats", "unable to serialize status: {}", e),
                        }
                    }
                })
                .await;
        })
    };

    let daily_handle = tokio::spawn(run_daily_reset(service.stats(), shutdown_rx.clone()));

    let poller_handle = service.poller().map(|poller| {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    });

    #[cfg(unix)]
    {
        let service = Arc::clone(&service);
        let overrides = args.clone();
        let mut shutdown = shutdown_rx.clone();
        let mut hangup =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = hangup.recv() => {
                        info!(target: "master", "reloading {}", overrides.config.display());
                        let result = overrides
                            .load_config()
                            .and_then(|config| service.reload(config, Some(&InterfaceDiscovery)));
                        if let Err(e) = result {
                            error!(target: "master", "reload failed, keeping current configuration: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    let mut receive_loop = {
        let dispatcher = service.dispatcher();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { server.run(dispatcher, shutdown).await })
    };

    // Handle shutdown gracefully
    let exit = tokio::select! {
        result = &mut receive_loop => result,
        _ = tokio::signal::ctrl_c() => {
            info!(target: "master", "received Ctrl+C, shutting down gracefully...");
            let _ = shutdown_tx.send(true);
            receive_loop.await
        }
    };
    let _ = shutdown_tx.send(true);

    let _ = sweeper_handle.await;
    let _ = daily_handle.await;
    if let Some(handle) = poller_handle {
        let _ = handle.await;
    }

    match exit {
        Ok(LoopExit::Shutdown) => {
            info!(target: "master", "shutdown complete");
            Ok(())
        }
        Ok(LoopExit::Failed(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}
