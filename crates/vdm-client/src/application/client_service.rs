//! ClientService: owns every display the client shows.
//!
//! | Message from the host         | Effect                                        |
//! |-------------------------------|-----------------------------------------------|
//! | `StartStreaming`              | open a [`ClientDisplay`] with the next id      |
//! | `StopStreaming{pause: false}` | release and forget that display               |
//! | `DisplayRotation`             | record the rotation on that display           |
//! | `DisplayChange`               | record title and focus on that display        |
//!
//! `DisplayFrame`s never pass through here; each display's decoder subscribes
//! to its own id.  When the connection comes up the service describes the
//! device (`DeviceCapabilities`); when it drops, every display is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, info, warn};
use vdm_core::protocol::{
    DeviceCapabilitiesMessage, DisplayChangeMessage, DisplayRotationMessage, RemoteMessage,
    SensorCapabilities, SensorEventMessage, StartStreamingMessage, StopStreamingMessage,
};
use vdm_core::DisplayId;
use vdm_link::infrastructure::codec::CodecFactory;
use vdm_link::infrastructure::remote_io::ConsumerId;
use vdm_link::sync::lock_unpoisoned;
use vdm_link::{ConnectionCallback, RemoteIo};

use super::client_display::{ClientDisplay, ClientError, Viewport};

/// What the client announces about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub device_name: String,
    pub viewport: Viewport,
    pub sensors: Vec<SensorCapabilities>,
}

struct ServiceState {
    displays: HashMap<DisplayId, Arc<ClientDisplay>>,
    next_display_id: DisplayId,
}

/// Client-side owner of all display sessions.
pub struct ClientService {
    remote_io: RemoteIo,
    codecs: Arc<dyn CodecFactory>,
    settings: Mutex<ClientSettings>,
    state: Mutex<ServiceState>,
    consumer: Mutex<Option<ConsumerId>>,
}

impl ClientService {
    /// Creates the service and subscribes it to `remote_io`.
    pub fn new(remote_io: RemoteIo, codecs: Arc<dyn CodecFactory>, settings: ClientSettings) -> Arc<Self> {
        let service = Arc::new(Self {
            remote_io: remote_io.clone(),
            codecs,
            settings: Mutex::new(settings),
            state: Mutex::new(ServiceState {
                displays: HashMap::new(),
                next_display_id: 1,
            }),
            consumer: Mutex::new(None),
        });
        let weak: Weak<Self> = Arc::downgrade(&service);
        let consumer = remote_io.add_message_consumer(move |msg| {
            if let Some(service) = weak.upgrade() {
                service.process_message(msg);
            }
        });
        *lock_unpoisoned(&service.consumer) = Some(consumer);
        service
    }

    // ── Client-initiated actions ──────────────────────────────────────────────

    /// Opens a display with the next free id and announces it to the host.
    pub fn open_display(&self, home_enabled: bool) -> Result<Arc<ClientDisplay>, ClientError> {
        let display_id = {
            let mut state = lock_unpoisoned(&self.state);
            let id = state.next_display_id;
            state.next_display_id += 1;
            id
        };
        let viewport = lock_unpoisoned(&self.settings).viewport;
        let display = Arc::new(ClientDisplay::open(
            display_id,
            home_enabled,
            viewport,
            self.remote_io.clone(),
            Arc::clone(&self.codecs),
        )?);
        lock_unpoisoned(&self.state).displays.insert(display_id, Arc::clone(&display));
        Ok(display)
    }

    /// Closes one display and tells the host.
    pub fn close_display(&self, display_id: DisplayId) -> Result<(), ClientError> {
        let display = lock_unpoisoned(&self.state).displays.remove(&display_id);
        let display = display.ok_or(ClientError::UnknownDisplay(display_id))?;
        display.close();
        Ok(())
    }

    /// Pauses every display, e.g. while the client window is hidden.
    pub fn pause_all(&self) {
        for display in self.snapshot() {
            display.pause();
        }
    }

    pub fn resume_all(&self) {
        for client_display in self.snapshot() {
            if let Err(e) = client_display.resume() {
                error!("Cannot resume client display {}: {e}", client_display.display_id());
            }
        }
    }

    /// Changes the viewport of every current and future display.
    pub fn set_viewport(&self, viewport: Viewport) {
        lock_unpoisoned(&self.settings).viewport = viewport;
        for client_display in self.snapshot() {
            if let Err(e) = client_display.resize(viewport) {
                error!("Cannot resize client display {}: {e}", client_display.display_id());
            }
        }
    }

    /// Sends one reading of a local sensor to the host.
    pub fn send_sensor_event(&self, sensor_type: i32, values: &[f32]) {
        self.remote_io.send(&RemoteMessage::SensorEvent(SensorEventMessage {
            sensor_type,
            values: values.to_vec(),
        }));
    }

    /// Releases every display without telling the host.
    pub fn release_all_displays(&self) {
        let displays: Vec<_> = lock_unpoisoned(&self.state).displays.drain().map(|(_, d)| d).collect();
        if !displays.is_empty() {
            info!("Releasing {} client displays", displays.len());
        }
        for display in displays {
            display.release();
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn display_ids(&self) -> Vec<DisplayId> {
        let mut ids: Vec<_> = lock_unpoisoned(&self.state).displays.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn display(&self, display_id: DisplayId) -> Option<Arc<ClientDisplay>> {
        lock_unpoisoned(&self.state).displays.get(&display_id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<ClientDisplay>> {
        lock_unpoisoned(&self.state).displays.values().cloned().collect()
    }

    // ── Inbound messages ──────────────────────────────────────────────────────

    fn process_message(&self, msg: &RemoteMessage) {
        match msg {
            RemoteMessage::StartStreaming(start) => self.on_start_streaming(start),
            RemoteMessage::StopStreaming(stop) => self.on_stop_streaming(stop),
            RemoteMessage::DisplayRotation(rotation) => self.on_display_rotation(rotation),
            RemoteMessage::DisplayChange(change) => self.on_display_change(change),
            _ => {}
        }
    }

    fn on_start_streaming(&self, start: &StartStreamingMessage) {
        match self.open_display(start.home_enabled) {
            Ok(client_display) => info!("Host started streaming to display {}", client_display.display_id()),
            Err(e) => error!("Cannot open a display for the host: {e}"),
        }
    }

    fn on_stop_streaming(&self, stop: &StopStreamingMessage) {
        if stop.pause {
            return;
        }
        let removed = lock_unpoisoned(&self.state).displays.remove(&stop.display_id);
        match removed {
            Some(display) => {
                info!("Host stopped display {}", stop.display_id);
                display.release();
            }
            None => warn!("Host stopped unknown display {}", stop.display_id),
        }
    }

    fn on_display_rotation(&self, rotation: &DisplayRotationMessage) {
        match self.display(rotation.display_id) {
            Some(display) => display.apply_rotation(rotation.rotation_degrees),
            None => warn!("Rotation for unknown display {}", rotation.display_id),
        }
    }

    fn on_display_change(&self, change: &DisplayChangeMessage) {
        if let Some(display) = self.display(change.display_id) {
            display.apply_display_change(&change.title, change.focused);
        }
    }
}

impl ConnectionCallback for ClientService {
    fn on_connected(&self, remote_device_name: &str) {
        let settings = lock_unpoisoned(&self.settings).clone();
        info!(
            "Connected to host '{remote_device_name}'; announcing '{}'",
            settings.device_name
        );
        self.remote_io.send(&RemoteMessage::DeviceCapabilities(DeviceCapabilitiesMessage {
            device_name: settings.device_name,
            sensors: settings.sensors,
        }));
    }

    fn on_disconnected(&self) {
        self.release_all_displays();
    }
}

impl Drop for ClientService {
    fn drop(&mut self) {
        if let Some(consumer) = lock_unpoisoned(&self.consumer).take() {
            self.remote_io.remove_message_consumer(consumer);
        }
        self.release_all_displays();
    }
}
