//! VDM client entry point.
//!
//! Finds a host on the local network, shows the displays it streams and
//! reconnects whenever the session drops.
//!
//! ```text
//! main()
//!  └─ load config.toml (+ --config / --name / --viewport overrides)
//!  └─ RemoteIo ──────────────┬─ ClientService (client displays)
//!  └─ ConnectionManager ─────┘   └─ ClientDisplay × n ─ decoder
//!  └─ lifecycle loop
//!       ├─ Disconnected / Error -> subscribe again
//!       └─ Ctrl-C               -> close displays, disconnect, exit
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vdm_client::infrastructure::storage::config::{config_file_path, load_config};
use vdm_client::{ClientService, ClientSettings, Viewport};
use vdm_link::infrastructure::codec::passthrough::PassthroughCodecFactory;
use vdm_link::infrastructure::discovery::lan::LanDiscovery;
use vdm_link::{ConnectionCallback, ConnectionManager, RemoteIo};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Shows virtual displays streamed by a VDM host on the local network.
#[derive(Debug, Parser)]
#[command(name = "vdm-client", version)]
struct Cli {
    /// Path of the configuration file (defaults to the platform config dir).
    #[arg(long, env = "VDM_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Device name announced to the host.
    #[arg(long)]
    name: Option<String>,

    /// Viewport as WIDTHxHEIGHT, e.g. 1280x800.
    #[arg(long)]
    viewport: Option<String>,
}

fn parse_viewport(text: &str, density_dpi: u32) -> anyhow::Result<Viewport> {
    let Some((width, height)) = text.split_once(['x', 'X']) else {
        bail!("viewport '{text}' is not WIDTHxHEIGHT");
    };
    Ok(Viewport {
        width: width.trim().parse().context("viewport width")?,
        height: height.trim().parse().context("viewport height")?,
        density_dpi,
    })
}

#[derive(Debug)]
enum SessionEvent {
    Disconnected,
    Error(String),
}

struct SessionEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionCallback for SessionEvents {
    fn on_connecting(&self, remote_device_name: &str) {
        info!("Connecting to host '{remote_device_name}'");
    }

    fn on_connected(&self, remote_device_name: &str) {
        info!("Connected to host '{remote_device_name}'");
    }

    fn on_disconnected(&self) {
        let _ = self.tx.send(SessionEvent::Disconnected);
    }

    fn on_error(&self, message: &str) {
        let _ = self.tx.send(SessionEvent::Error(message.to_string()));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => config_file_path().context("locating the client config file")?,
    };
    let mut config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(name) = cli.name {
        config.link.device_name = name;
    }
    let viewport = match cli.viewport.as_deref() {
        Some(text) => parse_viewport(text, config.client.density_dpi)?,
        None => config.client.viewport(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.client.log_level)),
        )
        .init();

    info!(
        "VDM client '{}' starting with a {}x{} viewport",
        config.link.device_name, viewport.width, viewport.height
    );

    let remote_io = RemoteIo::new();
    let service = ClientService::new(
        remote_io.clone(),
        Arc::new(PassthroughCodecFactory::new()),
        ClientSettings {
            device_name: config.link.device_name.clone(),
            viewport,
            sensors: Vec::new(),
        },
    );

    let transport = Arc::new(LanDiscovery::new(config.discovery.clone()));
    let connection = ConnectionManager::new(
        config.link.clone(),
        transport,
        remote_io,
        tokio::runtime::Handle::current(),
    );
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    connection.add_connection_callback(service.clone());
    connection.add_connection_callback(Arc::new(SessionEvents { tx: event_tx }));

    connection.start_client_session();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            event = event_rx.recv() => match event {
                Some(SessionEvent::Disconnected) => {
                    warn!("Host disconnected; looking for it again");
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    connection.start_client_session();
                }
                Some(SessionEvent::Error(message)) => {
                    error!("Session error: {message}");
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    connection.start_client_session();
                }
                None => break,
            },
        }
    }

    for display_id in service.display_ids() {
        if let Err(e) = service.close_display(display_id) {
            warn!("Cannot close display {display_id}: {e}");
        }
    }
    connection.disconnect();
    info!("VDM client stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_viewport_accepts_width_by_height() {
        let viewport = parse_viewport("1280x800", 213).unwrap();

        assert_eq!(
            viewport,
            Viewport {
                width: 1280,
                height: 800,
                density_dpi: 213
            }
        );
    }

    #[test]
    fn test_parse_viewport_rejects_missing_separator() {
        assert!(parse_viewport("1280", 213).is_err());
        assert!(parse_viewport("axb", 213).is_err());
    }
}
