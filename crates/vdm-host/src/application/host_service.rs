//! HostService: owns every display session of the connected client.
//!
//! The service is the host's single consumer of session-wide messages:
//!
//! | Message                       | Effect                                          |
//! |-------------------------------|-------------------------------------------------|
//! | `DeviceCapabilities`          | remember the client, register its sensors        |
//! | `DisplayCapabilities` (new)   | create a [`RemoteDisplay`] with the pending type |
//! | `DisplayCapabilities` (known) | reset that display (new size, encoder restart)   |
//! | `StopStreaming{pause: true}`  | pause that display's encoder                     |
//! | `StopStreaming{pause: false}` | close and forget that display                    |
//! | `SensorEvent`                 | forward to the virtual device                    |
//!
//! A display whose virtual display reports it is empty is closed and
//! forgotten the same way as a client `StopStreaming{pause: false}`, and the
//! client is told with `StopStreaming{pause: false}`.
//!
//! Input and home events never pass through here: each `RemoteDisplay`
//! subscribes to its own display id.
//!
//! # Display types
//!
//! The host decides what the next display shows *before* the client has
//! announced it: [`HostService::start_streaming`] records the requested
//! [`DisplayType`] and asks the client for a new display.  The type is applied
//! to the next display the client announces and then falls back to `App`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, info, warn};
use vdm_core::protocol::{
    DeviceCapabilitiesMessage, DisplayCapabilitiesMessage, RemoteMessage, SensorEventMessage,
    StartStreamingMessage, StopStreamingMessage,
};
use vdm_core::{DisplayGeometry, DisplayId, DisplayType};
use vdm_link::infrastructure::codec::CodecFactory;
use vdm_link::infrastructure::remote_io::ConsumerId;
use vdm_link::sync::lock_unpoisoned;
use vdm_link::{ConnectionCallback, RemoteIo};

use super::remote_display::{DisplayError, DisplaySettings, RemoteDisplay};
use crate::infrastructure::virtual_device::VirtualDevice;

#[derive(Default)]
struct ServiceState {
    displays: HashMap<DisplayId, Arc<RemoteDisplay>>,
    pending_type: DisplayType,
    remote_device: Option<DeviceCapabilitiesMessage>,
}

/// Host-side owner of all display sessions.
pub struct HostService {
    this: Weak<Self>,
    remote_io: RemoteIo,
    device: Arc<dyn VirtualDevice>,
    codecs: Arc<dyn CodecFactory>,
    settings: DisplaySettings,
    state: Mutex<ServiceState>,
    consumer: Mutex<Option<ConsumerId>>,
}

impl HostService {
    /// Creates the service and subscribes it to `remote_io`.
    pub fn new(
        remote_io: RemoteIo,
        device: Arc<dyn VirtualDevice>,
        codecs: Arc<dyn CodecFactory>,
        settings: DisplaySettings,
    ) -> Arc<Self> {
        let service = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            remote_io: remote_io.clone(),
            device,
            codecs,
            settings,
            state: Mutex::new(ServiceState::default()),
            consumer: Mutex::new(None),
        });
        let weak = Weak::clone(&service.this);
        let consumer = remote_io.add_message_consumer(move |msg| {
            if let Some(service) = weak.upgrade() {
                service.process_message(msg);
            }
        });
        *lock_unpoisoned(&service.consumer) = Some(consumer);
        service
    }

    // ── Host-initiated actions ────────────────────────────────────────────────

    /// Asks the client for a new display that will show `display_type`.
    pub fn start_streaming(&self, display_type: DisplayType) {
        lock_unpoisoned(&self.state).pending_type = display_type;
        info!("Requesting a new {display_type:?} display from the client");
        self.remote_io.send(&RemoteMessage::StartStreaming(StartStreamingMessage {
            home_enabled: display_type.supports_home(),
        }));
    }

    /// Closes one display.  The client is told through the display's own
    /// `StopStreaming` message.
    pub fn stop_streaming(&self, remote_id: DisplayId) -> Result<(), DisplayError> {
        let display = lock_unpoisoned(&self.state).displays.remove(&remote_id);
        let display = display.ok_or(DisplayError::UnknownDisplay(remote_id))?;
        display.close();
        Ok(())
    }

    /// Reports a title/focus change of one display to the client.
    pub fn notify_display_change(&self, remote_id: DisplayId, title: &str, focused: bool) -> Result<(), DisplayError> {
        let display = self.display(remote_id).ok_or(DisplayError::UnknownDisplay(remote_id))?;
        display.send_display_change(title, focused);
        Ok(())
    }

    /// Closes every display session.
    pub fn close_all_displays(&self) {
        let displays: Vec<_> = lock_unpoisoned(&self.state).displays.drain().map(|(_, d)| d).collect();
        if !displays.is_empty() {
            info!("Closing {} display sessions", displays.len());
        }
        for display in displays {
            display.close();
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn display_ids(&self) -> Vec<DisplayId> {
        let mut ids: Vec<_> = lock_unpoisoned(&self.state).displays.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn display(&self, remote_id: DisplayId) -> Option<Arc<RemoteDisplay>> {
        lock_unpoisoned(&self.state).displays.get(&remote_id).cloned()
    }

    /// Capabilities of the connected client, once it has announced them.
    pub fn remote_device(&self) -> Option<DeviceCapabilitiesMessage> {
        lock_unpoisoned(&self.state).remote_device.clone()
    }

    pub fn pending_display_type(&self) -> DisplayType {
        lock_unpoisoned(&self.state).pending_type
    }

    // ── Inbound messages ──────────────────────────────────────────────────────

    fn process_message(&self, msg: &RemoteMessage) {
        match msg {
            RemoteMessage::DeviceCapabilities(caps) => self.on_device_capabilities(caps),
            RemoteMessage::DisplayCapabilities(caps) => self.on_display_capabilities(caps),
            RemoteMessage::StopStreaming(stop) => self.on_stop_streaming(stop),
            RemoteMessage::SensorEvent(event) => self.on_sensor_event(event),
            _ => {}
        }
    }

    fn on_device_capabilities(&self, caps: &DeviceCapabilitiesMessage) {
        info!(
            "Client '{}' connected with {} sensors",
            caps.device_name,
            caps.sensors.len()
        );
        self.device.register_remote_sensors(&caps.device_name, &caps.sensors);
        lock_unpoisoned(&self.state).remote_device = Some(caps.clone());
    }

    fn on_display_capabilities(&self, caps: &DisplayCapabilitiesMessage) {
        let geometry = DisplayGeometry::from_capabilities(caps);

        // Creating or resetting a display sends messages, and a failed send
        // re-enters through `on_disconnected`; the state lock must be free.
        let (existing, display_type) = {
            let mut state = lock_unpoisoned(&self.state);
            match state.displays.get(&caps.display_id).cloned() {
                Some(display) => (Some(display), DisplayType::default()),
                None => (None, std::mem::take(&mut state.pending_type)),
            }
        };
        if let Some(display) = existing {
            if let Err(e) = display.reset(geometry) {
                error!("Cannot reset remote display {}: {e}", caps.display_id);
            }
            return;
        }

        let display = match RemoteDisplay::create(
            caps.display_id,
            geometry,
            display_type,
            Arc::clone(&self.device),
            Arc::clone(&self.codecs),
            self.remote_io.clone(),
            self.settings.clone(),
        ) {
            Ok(display) => display,
            Err(e) => {
                error!("Cannot create remote display {}: {e}", caps.display_id);
                return;
            }
        };
        lock_unpoisoned(&self.state)
            .displays
            .insert(caps.display_id, Arc::clone(&display));
        let service = Weak::clone(&self.this);
        display.set_empty_handler(Arc::new(move |remote_id| {
            if let Some(service) = service.upgrade() {
                service.on_display_empty(remote_id);
            }
        }));
    }

    fn on_display_empty(&self, remote_id: DisplayId) {
        let removed = lock_unpoisoned(&self.state).displays.remove(&remote_id);
        if let Some(display) = removed {
            display.close();
        }
    }

    fn on_stop_streaming(&self, stop: &StopStreamingMessage) {
        if stop.pause {
            match self.display(stop.display_id) {
                Some(display) => display.pause(),
                None => warn!("Pause for unknown remote display {}", stop.display_id),
            }
            return;
        }
        let removed = lock_unpoisoned(&self.state).displays.remove(&stop.display_id);
        if let Some(display) = removed {
            info!("Client stopped remote display {}", stop.display_id);
            display.close();
        }
    }

    fn on_sensor_event(&self, event: &SensorEventMessage) {
        if let Err(e) = self.device.send_sensor_event(event.sensor_type, &event.values) {
            warn!("Sensor event {} dropped: {e}", event.sensor_type);
        }
    }
}

impl ConnectionCallback for HostService {
    fn on_disconnected(&self) {
        self.close_all_displays();
        let mut state = lock_unpoisoned(&self.state);
        state.remote_device = None;
        state.pending_type = DisplayType::default();
        drop(state);
        self.device.clear_remote_sensors();
    }
}

impl Drop for HostService {
    fn drop(&mut self) {
        if let Some(consumer) = lock_unpoisoned(&self.consumer).take() {
            self.remote_io.remove_message_consumer(consumer);
        }
        self.close_all_displays();
    }
}
