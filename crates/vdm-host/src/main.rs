//! VDM host entry point.
//!
//! Wires the session coordinator, the display service and the virtual device
//! together, then runs until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load config.toml (+ --config / --name overrides)
//!  └─ RemoteIo ──────────────┬─ HostService (display sessions)
//!  └─ ConnectionManager ─────┘   └─ RemoteDisplay × n ─ MockVirtualDevice
//!  └─ frame ticker thread     -- renders a test pattern on every display
//!  └─ lifecycle loop
//!       ├─ Connected     -> ask the client for the first display
//!       ├─ Disconnected  -> publish the service again
//!       └─ Ctrl-C        -> disconnect, close displays, exit
//! ```
//!
//! # Virtual device
//!
//! `MockVirtualDevice` logs every display and input event instead of talking
//! to a platform compositor.  The ticker thread plays the part of the
//! compositor by pushing a synthetic frame at the configured frame rate.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vdm_core::DisplayType;
use vdm_host::infrastructure::storage::config::{config_file_path, load_config};
use vdm_host::infrastructure::virtual_device::mock::MockVirtualDevice;
use vdm_host::{DisplaySettings, HostService};
use vdm_link::infrastructure::codec::passthrough::PassthroughCodecFactory;
use vdm_link::infrastructure::discovery::lan::LanDiscovery;
use vdm_link::{ConnectionCallback, ConnectionManager, RemoteIo};

/// Delay before the service is published again after a lost session.
const REPUBLISH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DisplayKind {
    App,
    Home,
    Mirror,
}

impl From<DisplayKind> for DisplayType {
    fn from(kind: DisplayKind) -> Self {
        match kind {
            DisplayKind::App => DisplayType::App,
            DisplayKind::Home => DisplayType::Home,
            DisplayKind::Mirror => DisplayType::Mirror,
        }
    }
}

/// Streams virtual displays to a companion client on the local network.
#[derive(Debug, Parser)]
#[command(name = "vdm-host", version)]
struct Cli {
    /// Path of the configuration file (defaults to the platform config dir).
    #[arg(long, env = "VDM_HOST_CONFIG")]
    config: Option<PathBuf>,

    /// Device name announced to the client.
    #[arg(long)]
    name: Option<String>,

    /// What the first display requested after connecting shows.
    #[arg(long, value_enum, default_value = "app")]
    display_type: DisplayKind,
}

/// Session lifecycle notifications forwarded to the main loop.
#[derive(Debug)]
enum SessionEvent {
    Connected(String),
    Disconnected,
    Error(String),
}

struct SessionEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionCallback for SessionEvents {
    fn on_initialized(&self) {
        info!("Service published; waiting for a client");
    }

    fn on_connected(&self, remote_device_name: &str) {
        let _ = self.tx.send(SessionEvent::Connected(remote_device_name.to_string()));
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
        None => config_file_path().context("locating the host config file")?,
    };
    let mut config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(name) = cli.name {
        config.link.device_name = name;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.host.log_level)),
        )
        .init();

    info!("VDM host '{}' starting", config.link.device_name);

    let running = Arc::new(AtomicBool::new(true));

    // ── Display side ──────────────────────────────────────────────────────────
    let remote_io = RemoteIo::new();
    let device = MockVirtualDevice::new();
    let service = HostService::new(
        remote_io.clone(),
        Arc::new(device.clone()),
        Arc::new(PassthroughCodecFactory::new()),
        DisplaySettings {
            frame_rate: config.host.display_fps,
            rotation_enabled: config.host.display_rotation_enabled,
            record_dir: config.host.record_dir.clone(),
        },
    );

    // ── Session side ──────────────────────────────────────────────────────────
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

    let ticker = spawn_frame_ticker(device, config.host.display_fps, Arc::clone(&running))
        .context("starting the frame ticker")?;

    connection.start_host_session();

    // ── Lifecycle loop ────────────────────────────────────────────────────────
    let first_display: DisplayType = cli.display_type.into();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            event = event_rx.recv() => match event {
                Some(SessionEvent::Connected(name)) => {
                    info!("Connected to '{name}'");
                    service.start_streaming(first_display);
                }
                Some(SessionEvent::Disconnected) => {
                    warn!("Client disconnected; publishing again");
                    tokio::time::sleep(REPUBLISH_DELAY).await;
                    connection.start_host_session();
                }
                Some(SessionEvent::Error(message)) => {
                    error!("Session error: {message}");
                    tokio::time::sleep(REPUBLISH_DELAY).await;
                    connection.start_host_session();
                }
                None => break,
            },
        }
    }

    running.store(false, Ordering::Relaxed);
    connection.disconnect();
    service.close_all_displays();
    if ticker.join().is_err() {
        error!("frame ticker panicked");
    }
    info!("VDM host stopped");
    Ok(())
}

/// Renders a moving test pattern on every display at `fps`.
fn spawn_frame_ticker(
    device: MockVirtualDevice,
    fps: u32,
    running: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let period = Duration::from_micros(1_000_000 / u64::from(fps.max(1)));
    thread::Builder::new().name("vdm-frame-ticker".to_string()).spawn(move || {
        let started = Instant::now();
        let mut frame: u32 = 0;
        while running.load(Ordering::Relaxed) {
            let pattern: Vec<u8> = frame.to_be_bytes().iter().copied().cycle().take(64).collect();
            let presentation_time_us = i64::try_from(started.elapsed().as_micros()).unwrap_or(i64::MAX);
            device.render_all(&pattern, presentation_time_us);
            frame = frame.wrapping_add(1);
            thread::sleep(period);
        }
    })
}
