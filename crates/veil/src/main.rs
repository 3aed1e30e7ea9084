//! veil: onion-routing tunnel
//!
//! Starts tor with the stored transport settings, exposes it as local
//! SOCKS and DNS listeners and reports progress until Ctrl-C.
//!
//! ```text
//! veil [--config <file.toml|file.json>] [--relay]
//! ```

mod host;

use anyhow::{Context, Result, bail};
use host::DesktopHost;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use veil_vpn::{
    ConnectionController, ConnectionStatus, DaemonLauncher, EventBus, RelayCoordinator,
    SettingsStore, SnowflakeProxyLauncher, TunnelEvent, TunnelSupervisor, VeilConfig,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const USAGE: &str = "usage: veil [--config <file>] [--relay]";

/// Command-line arguments
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    relay: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Args::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    let path = args.next().context("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--relay" => parsed.relay = true,
                "--help" | "-h" => {
                    println!("{}", USAGE);
                    std::process::exit(0);
                }
                other => bail!("unknown argument '{}'\n{}", other, USAGE),
            }
        }

        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse(std::env::args().skip(1))?;

    let config = match &args.config {
        Some(path) => VeilConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => VeilConfig::default(),
    };
    config.validate().context("Invalid configuration")?;

    let settings = Arc::new(match &config.settings_file {
        Some(path) => SettingsStore::load(path).context("Failed to load settings")?,
        None => SettingsStore::default(),
    });

    info!("veil starting...");
    info!(transport = %settings.transport(), smart_connect = settings.smart_connect(), "Settings loaded");

    let events = EventBus::default();
    let supervisor = TunnelSupervisor::spawn(
        Arc::new(DaemonLauncher::new(config.tunnel.clone())),
        Arc::clone(&settings),
        config.tunnel.clone(),
    );
    let controller = ConnectionController::new(
        Arc::new(DesktopHost),
        supervisor.clone(),
        Arc::clone(&settings),
        events.clone(),
    )
    .await;
    let relay = RelayCoordinator::new(
        Arc::new(SnowflakeProxyLauncher::new(&config.relay)),
        Arc::clone(&settings),
        events.clone(),
        config.relay.clone(),
    );

    tokio::spawn(report_events(Arc::clone(&controller), supervisor));

    if args.relay {
        relay.toggle().await.context("Failed to start relay")?;
        info!(sessions_helped = relay.sessions_helped(), "Relay running");
    }

    controller.control(true).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("veil shutting down");
    controller.disconnect().await;
    if let Err(e) = controller.supervisor().stop().await {
        warn!("Supervisor unavailable: {}", e);
    }
    relay.shutdown().await;
    Ok(())
}

/// Log status changes, and the circuits once connected
async fn report_events(controller: Arc<ConnectionController>, supervisor: TunnelSupervisor) {
    let mut events = controller.events().subscribe();
    let mut last_status = ConnectionStatus::Unknown;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event reporter lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        match event {
            TunnelEvent::Progress(progress) => info!("Bootstrapped {}%", progress),
            TunnelEvent::StatusChanged => {
                let snapshot = controller.snapshot().await;
                if snapshot.status == last_status {
                    continue;
                }
                last_status = snapshot.status;

                match (&snapshot.addresses, snapshot.error) {
                    (Some(addresses), _) => info!("{}: {}", snapshot.status, addresses),
                    (None, Some(error)) => warn!("{}: {}", snapshot.status, error),
                    (None, None) => info!("{}", snapshot.status),
                }

                if snapshot.status == ConnectionStatus::Connected {
                    log_circuits(&supervisor).await;
                }
            }
        }
    }
}

async fn log_circuits(supervisor: &TunnelSupervisor) {
    match supervisor.circuits().await {
        Ok(circuits) => {
            for circuit in circuits {
                let path: Vec<String> = circuit.nodes.iter().map(|n| n.to_string()).collect();
                info!(circuit = %circuit.id, "{}", path.join(" → "));
            }
        }
        Err(e) => warn!("Circuits unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Result<Args> {
        Args::parse(items.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        let parsed = args(&["--config", "veil.toml", "--relay"]).unwrap();

        assert_eq!(parsed.config, Some(PathBuf::from("veil.toml")));
        assert!(parsed.relay);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--bogus"]).is_err());
        assert!(!args(&[]).unwrap().relay);
    }
}
