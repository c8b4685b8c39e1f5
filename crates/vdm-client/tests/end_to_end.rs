//! End-to-end session: a real host service and a client service connected
//! through two `ConnectionManager`s.
//!
//! ```text
//! HostService ── RemoteIo ══ 127.0.0.1 TCP ══ RemoteIo ── ClientService
//!  └ MockVirtualDevice                                     └ ClientDisplay
//!  └ PassthroughCodec (encoder)                              └ MockCodec (decoder)
//! ```
//!
//! The host encodes with the identity codec, so the bytes rendered on the
//! host's virtual display must arrive unchanged in the client's decoder.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_test::assert_ok;
use vdm_client::{ClientService, ClientSettings, Viewport};
use vdm_core::protocol::{InputDeviceType, InputEventKind, KeyEvent};
use vdm_core::DisplayType;
use vdm_host::infrastructure::virtual_device::mock::{MockVirtualDevice, SinkEvent};
use vdm_host::{DisplaySettings, HostService};
use vdm_link::config::LinkConfig;
use vdm_link::infrastructure::codec::mock::MockCodecFactory;
use vdm_link::infrastructure::codec::passthrough::PassthroughCodecFactory;
use vdm_link::infrastructure::discovery::mock::MockDiscoveryNetwork;
use vdm_link::{ConnectionCallback, ConnectionManager, RemoteIo};

// ── Helpers ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Connected(Mutex<usize>);

impl ConnectionCallback for Connected {
    fn on_connected(&self, _remote_device_name: &str) {
        *self.0.lock().unwrap() += 1;
    }
}

impl Connected {
    fn count(&self) -> usize {
        *self.0.lock().unwrap()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn link_config(name: &str) -> LinkConfig {
    LinkConfig {
        device_name: name.to_string(),
        bind_address: "127.0.0.1".to_string(),
        handshake_timeout_ms: 2_000,
        attach_retry_delay_ms: 10,
        ..LinkConfig::default()
    }
}

struct Session {
    host: ConnectionManager,
    client: ConnectionManager,
    host_service: Arc<HostService>,
    client_service: Arc<ClientService>,
    device: MockVirtualDevice,
    decoders: MockCodecFactory,
}

async fn connect() -> Session {
    let network = MockDiscoveryNetwork::new();
    let device = MockVirtualDevice::new();
    let decoders = MockCodecFactory::new();

    let host_io = RemoteIo::new();
    let host = ConnectionManager::new(link_config("host-1"), network.transport(), host_io.clone(), Handle::current());
    let host_service = HostService::new(
        host_io,
        Arc::new(device.clone()),
        Arc::new(PassthroughCodecFactory::new()),
        DisplaySettings::default(),
    );
    let host_connected = Arc::new(Connected::default());
    host.add_connection_callback(host_service.clone());
    host.add_connection_callback(host_connected.clone());

    let client_io = RemoteIo::new();
    let client = ConnectionManager::new(link_config("client-A"), network.transport(), client_io.clone(), Handle::current());
    let client_service = ClientService::new(
        client_io,
        Arc::new(decoders.clone()),
        ClientSettings {
            device_name: "tablet".to_string(),
            viewport: Viewport {
                width: 805,
                height: 1280,
                density_dpi: 213,
            },
            sensors: Vec::new(),
        },
    );
    let client_connected = Arc::new(Connected::default());
    client.add_connection_callback(client_service.clone());
    client.add_connection_callback(client_connected.clone());

    host.start_host_session();
    wait_until(|| network.publish_count() == 1).await;
    client.start_client_session();
    wait_until(|| host_connected.count() == 1 && client_connected.count() == 1).await;

    Session {
        host,
        client,
        host_service,
        client_service,
        device,
        decoders,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_request_creates_matching_displays_on_both_sides() {
    // Arrange
    let s = connect().await;
    wait_until(|| s.host_service.remote_device().is_some()).await;

    // Act
    s.host_service.start_streaming(DisplayType::Home);
    wait_until(|| s.host_service.display_ids() == vec![1]).await;

    // Assert
    assert_eq!(s.host_service.remote_device().unwrap().device_name, "tablet");
    let client_display = s.client_service.display(1).expect("client display");
    assert!(client_display.home_enabled());
    let host_display = s.host_service.display(1).expect("host display");
    assert_eq!(host_display.display_type(), DisplayType::Home);
    let geometry = host_display.geometry();
    assert_eq!((geometry.width, geometry.height, geometry.density_dpi), (800, 1280, 213));
    let decoder_format = s.decoders.last().unwrap().format().unwrap();
    assert_eq!((decoder_format.width, decoder_format.height), (800, 1280));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rendered_content_reaches_client_decoder_and_input_comes_back() {
    // Arrange
    let s = connect().await;
    s.host_service.start_streaming(DisplayType::App);
    wait_until(|| s.host_service.display(1).is_some()).await;
    let decoder = s.decoders.last().unwrap();
    decoder.offer_input_buffer(0);
    let host_display_id = s.host_service.display(1).unwrap().host_display_id();

    // Act
    assert!(s.device.render_frame(host_display_id, &[0xAB; 32], 1_000));
    wait_until(|| !decoder.queued_inputs().is_empty()).await;
    let display = s.client_service.display(1).unwrap();
    assert_ok!(display.send_input(
        InputDeviceType::Keyboard,
        InputEventKind::Key(KeyEvent {
            key_code: 29,
            action: 0,
        }),
    ));
    wait_until(|| !s.device.sinks_of(host_display_id, InputDeviceType::Keyboard).is_empty()).await;

    // Assert
    let queued = decoder.queued_inputs();
    assert_eq!(queued[0].data, vec![0xAB; 32]);
    assert_eq!(queued[0].presentation_time_us, 1_000);
    assert_eq!(display.fault(), None);
    let keyboard = &s.device.sinks_of(host_display_id, InputDeviceType::Keyboard)[0];
    assert_eq!(
        keyboard.events,
        vec![SinkEvent::Key {
            key_code: 29,
            action: 0
        }]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_close_releases_host_display() {
    // Arrange
    let s = connect().await;
    s.host_service.start_streaming(DisplayType::App);
    wait_until(|| s.host_service.display(1).is_some()).await;

    // Act
    assert_ok!(s.client_service.close_display(1));
    wait_until(|| s.host_service.display_ids().is_empty()).await;

    // Assert
    assert_eq!(s.device.displays()[0].release_count, 1);
    assert!(s.client_service.display_ids().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_stop_removes_client_display() {
    // Arrange
    let s = connect().await;
    s.host_service.start_streaming(DisplayType::App);
    wait_until(|| s.host_service.display(1).is_some()).await;

    // Act
    assert_ok!(s.host_service.stop_streaming(1));
    wait_until(|| s.client_service.display_ids().is_empty()).await;

    // Assert
    assert_eq!(s.decoders.last().unwrap().release_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_tears_down_both_sides() {
    // Arrange
    let s = connect().await;
    s.host_service.start_streaming(DisplayType::App);
    wait_until(|| s.host_service.display(1).is_some()).await;

    // Act
    s.client.disconnect();
    wait_until(|| s.host_service.display_ids().is_empty() && s.client_service.display_ids().is_empty()).await;

    // Assert
    assert!(!s.host.is_connected());
    assert_eq!(s.device.displays()[0].release_count, 1);
    assert_eq!(s.decoders.last().unwrap().release_count(), 1);
    assert_eq!(s.host_service.remote_device(), None);
}
