//! Identity codec.
//!
//! [`PassthroughCodec`] copies each queued input buffer to an output buffer
//! unchanged.  It behaves like a real asynchronous codec (fixed input buffer
//! pool, callbacks on its own thread) so the whole streaming path can run on
//! machines without platform media APIs.  When the decoder releases an output
//! buffer with `render == true` the bytes go to the optional
//! [`FrameRenderer`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use super::{BufferInfo, CodecCallback, CodecError, CodecFactory, CodecRole, VideoCodec, VideoFormat};
use vdm_core::protocol::messages::frame_flags;

/// Receives the bytes of every rendered decoder output buffer.
pub type FrameRenderer = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Default number of input buffers a codec offers.
pub const DEFAULT_INPUT_BUFFERS: usize = 4;

enum CallbackEvent {
    InputAvailable(usize),
    OutputAvailable(usize, BufferInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Configured,
    Running,
    Stopped,
    Released,
}

/// Identity codec with a callback thread.
pub struct PassthroughCodec {
    role: CodecRole,
    state: State,
    input_buffer_count: usize,
    inputs: Vec<Vec<u8>>,
    outputs: Vec<Option<Vec<u8>>>,
    callback: Option<Arc<dyn CodecCallback>>,
    events: Option<Sender<CallbackEvent>>,
    worker: Option<JoinHandle<()>>,
    renderer: Option<FrameRenderer>,
}

impl PassthroughCodec {
    pub fn new(role: CodecRole, input_buffer_count: usize, renderer: Option<FrameRenderer>) -> Self {
        Self {
            role,
            state: State::Created,
            input_buffer_count: input_buffer_count.max(1),
            inputs: Vec::new(),
            outputs: Vec::new(),
            callback: None,
            events: None,
            worker: None,
            renderer,
        }
    }

    fn post(&self, event: CallbackEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn require(&self, expected: State, action: &str) -> Result<(), CodecError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CodecError::InvalidState(format!(
                "cannot {action} a {:?} codec in state {:?}",
                self.role, self.state
            )))
        }
    }

    /// Closes the event channel and waits for the callback thread.  When
    /// called from a callback the thread is left to finish on its own: it
    /// exits once the channel drains.
    fn stop_worker(&mut self) {
        self.events = None;
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                debug!("passthrough {:?} stopped from its own callback thread", self.role);
                return;
            }
            if worker.join().is_err() {
                warn!("passthrough codec callback thread panicked");
            }
        }
    }
}

fn callback_loop(events: Receiver<CallbackEvent>, callback: Arc<dyn CodecCallback>) {
    for event in events {
        match event {
            CallbackEvent::InputAvailable(index) => callback.on_input_buffer_available(index),
            CallbackEvent::OutputAvailable(index, info) => {
                callback.on_output_buffer_available(index, info)
            }
        }
    }
}

impl VideoCodec for PassthroughCodec {
    fn configure(&mut self, format: &VideoFormat, callback: Arc<dyn CodecCallback>) -> Result<(), CodecError> {
        self.require(State::Created, "configure")?;
        debug!(
            "passthrough {:?} configured for {}x{} {}",
            self.role, format.width, format.height, format.mime_type
        );
        self.callback = Some(callback);
        self.state = State::Configured;
        Ok(())
    }

    fn start(&mut self) -> Result<(), CodecError> {
        self.require(State::Configured, "start")?;
        let callback = self
            .callback
            .clone()
            .ok_or_else(|| CodecError::InvalidState("no callback installed".to_string()))?;
        let (tx, rx) = channel::unbounded();
        let worker = thread::Builder::new()
            .name("vdm-passthrough-codec".to_string())
            .spawn(move || callback_loop(rx, callback))
            .map_err(|e| CodecError::Backend(format!("cannot start callback thread: {e}")))?;

        self.inputs = vec![Vec::new(); self.input_buffer_count];
        self.events = Some(tx);
        self.worker = Some(worker);
        self.state = State::Running;
        for index in 0..self.input_buffer_count {
            self.post(CallbackEvent::InputAvailable(index));
        }
        Ok(())
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut Vec<u8>> {
        if self.state != State::Running {
            return None;
        }
        self.inputs.get_mut(index)
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    ) -> Result<(), CodecError> {
        self.require(State::Running, "queue input on")?;
        let input = self.inputs.get_mut(index).ok_or(CodecError::InvalidBuffer(index))?;
        let data: Vec<u8> = input.drain(..size.min(input.len())).collect();
        input.clear();

        let slot = match self.outputs.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.outputs.push(None);
                self.outputs.len() - 1
            }
        };
        let info = BufferInfo {
            offset: 0,
            size: data.len(),
            presentation_time_us,
            flags,
        };
        self.outputs[slot] = Some(data);
        self.post(CallbackEvent::OutputAvailable(slot, info));
        self.post(CallbackEvent::InputAvailable(index));
        Ok(())
    }

    fn output_buffer(&mut self, index: usize) -> Option<&[u8]> {
        self.outputs.get(index).and_then(|o| o.as_deref())
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError> {
        let data = self
            .outputs
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(CodecError::InvalidBuffer(index))?;
        if render {
            if let Some(renderer) = &self.renderer {
                renderer(&data);
            }
        }
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError> {
        self.require(State::Running, "signal end of stream on")?;
        let info = BufferInfo {
            offset: 0,
            size: 0,
            presentation_time_us: 0,
            flags: frame_flags::END_OF_STREAM,
        };
        self.outputs.push(Some(Vec::new()));
        self.post(CallbackEvent::OutputAvailable(self.outputs.len() - 1, info));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.outputs.clear();
        for input in &mut self.inputs {
            input.clear();
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.stop_worker();
        if self.state != State::Released {
            self.state = State::Stopped;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.stop_worker();
        self.inputs.clear();
        self.outputs.clear();
        self.callback = None;
        self.state = State::Released;
    }
}

impl Drop for PassthroughCodec {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Factory producing [`PassthroughCodec`]s.
#[derive(Clone, Default)]
pub struct PassthroughCodecFactory {
    renderer: Option<FrameRenderer>,
}

impl PassthroughCodecFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoders created by this factory hand rendered frames to `renderer`.
    pub fn with_renderer(renderer: FrameRenderer) -> Self {
        Self {
            renderer: Some(renderer),
        }
    }
}

impl CodecFactory for PassthroughCodecFactory {
    fn create(&self, role: CodecRole, mime_type: &str) -> Result<Box<dyn VideoCodec>, CodecError> {
        debug!("creating passthrough {role:?} for {mime_type}");
        let renderer = match role {
            CodecRole::Decoder => self.renderer.clone(),
            CodecRole::Encoder => None,
        };
        Ok(Box::new(PassthroughCodec::new(role, DEFAULT_INPUT_BUFFERS, renderer)))
    }
}
