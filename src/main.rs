//! Braid CLI: multipath IP-over-QUIC tunnel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use braid::client::{SchedulerHandle, TunnelClient};
use braid::config::{init_logging, Config};
use braid::error::Result;
use braid::server::TunnelServer;
use braid::tun::TunIo;
use braid::types::Role;

/// After the first shutdown signal, the process gets this long to wind
/// down before it is force-exited.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(
    name = "braid",
    version = braid::VERSION,
    about = "Multipath IP-over-QUIC tunnel with FEC-striped UDP side transport"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("fatal: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    init_logging(&config.log_level, &config.log_format)?;
    info!(version = braid::VERSION, role = %config.role, "starting");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let tun = open_tun(&config)?;
    let scheduler = SchedulerHandle::new();

    if let Some(listen) = config.control_api_listen {
        let control_config = config.clone();
        let control_scheduler = Arc::clone(&scheduler);
        let control_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) =
                braid::control::run(listen, control_config, control_scheduler, control_cancel)
                    .await
            {
                error!(error = %e, "control API failed");
            }
        });
    }

    match config.role {
        Role::Client => {
            let client = TunnelClient::new(config, tun, scheduler, cancel.clone());
            client.run().await
        }
        Role::Server => {
            let server = TunnelServer::new(config.clone(), tun, cancel.clone()).await?;
            braid::telemetry::spawn_server(
                server.table(),
                server.stripe(),
                config.telemetry_interval,
                cancel.clone(),
            );
            server.run().await
        }
    }
}

#[cfg(target_os = "linux")]
fn open_tun(config: &Config) -> Result<Arc<dyn TunIo>> {
    Ok(Arc::new(braid::tun::TunDevice::open(&config.tun_name)?))
}

#[cfg(not(target_os = "linux"))]
fn open_tun(_config: &Config) -> Result<Arc<dyn TunIo>> {
    Err(braid::Error::Config(
        "TUN devices are only supported on Linux".into(),
    ))
}

/// SIGINT/SIGTERM cancel the root token; a watchdog force-exits if the
/// wind-down stalls past the deadline.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("shutdown signal received");
        cancel.cancel();

        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        error!("shutdown deadline exceeded, forcing exit");
        std::process::exit(1);
    });
}
