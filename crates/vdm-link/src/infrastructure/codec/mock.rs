//! Scriptable codec for tests.
//!
//! A [`MockCodec`] never produces buffers on its own.  The test drives it
//! through a [`MockCodecHandle`]: `offer_input_buffer` plays the role of the
//! codec announcing a free input buffer, `emit_output` the role of the codec
//! producing output.  Every call the pipeline makes on the codec is recorded
//! and can be inspected through the handle.
//!
//! Handle methods invoke the installed callback on the calling thread with no
//! codec lock held, which satisfies the callback threading contract as long
//! as the test thread is not itself inside a codec call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{BufferInfo, CodecCallback, CodecError, CodecFactory, CodecRole, VideoCodec, VideoFormat};
use crate::sync::lock_unpoisoned;

/// One input buffer the pipeline handed back to the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedInput {
    pub index: usize,
    pub data: Vec<u8>,
    pub presentation_time_us: i64,
    pub flags: u32,
}

#[derive(Default)]
struct MockCodecState {
    role: Option<CodecRole>,
    format: Option<VideoFormat>,
    callback: Option<Arc<dyn CodecCallback>>,
    started: bool,
    queued_inputs: Vec<QueuedInput>,
    pending_outputs: HashMap<usize, Vec<u8>>,
    released_outputs: Vec<(usize, bool)>,
    end_of_stream_signalled: bool,
    flush_count: usize,
    stop_count: usize,
    release_count: usize,
}

/// Test codec whose buffers are supplied by a [`MockCodecHandle`].
pub struct MockCodec {
    state: Arc<Mutex<MockCodecState>>,
    inputs: HashMap<usize, Vec<u8>>,
    outputs: HashMap<usize, Vec<u8>>,
}

impl MockCodec {
    pub fn new(role: CodecRole) -> (Self, MockCodecHandle) {
        let state = Arc::new(Mutex::new(MockCodecState {
            role: Some(role),
            ..MockCodecState::default()
        }));
        let codec = Self {
            state: Arc::clone(&state),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
        };
        (codec, MockCodecHandle { state })
    }
}

impl VideoCodec for MockCodec {
    fn configure(&mut self, format: &VideoFormat, callback: Arc<dyn CodecCallback>) -> Result<(), CodecError> {
        let mut state = lock_unpoisoned(&self.state);
        state.format = Some(format.clone());
        state.callback = Some(callback);
        Ok(())
    }

    fn start(&mut self) -> Result<(), CodecError> {
        lock_unpoisoned(&self.state).started = true;
        Ok(())
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut Vec<u8>> {
        Some(self.inputs.entry(index).or_default())
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    ) -> Result<(), CodecError> {
        let mut data = self.inputs.remove(&index).unwrap_or_default();
        data.truncate(size);
        lock_unpoisoned(&self.state).queued_inputs.push(QueuedInput {
            index,
            data,
            presentation_time_us,
            flags,
        });
        Ok(())
    }

    fn output_buffer(&mut self, index: usize) -> Option<&[u8]> {
        if let Some(data) = lock_unpoisoned(&self.state).pending_outputs.remove(&index) {
            self.outputs.insert(index, data);
        }
        self.outputs.get(&index).map(Vec::as_slice)
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError> {
        let mut state = lock_unpoisoned(&self.state);
        let known = self.outputs.remove(&index).is_some() || state.pending_outputs.remove(&index).is_some();
        if !known {
            return Err(CodecError::InvalidBuffer(index));
        }
        state.released_outputs.push((index, render));
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError> {
        lock_unpoisoned(&self.state).end_of_stream_signalled = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.inputs.clear();
        self.outputs.clear();
        lock_unpoisoned(&self.state).flush_count += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        let mut state = lock_unpoisoned(&self.state);
        state.stop_count += 1;
        state.started = false;
        Ok(())
    }

    fn release(&mut self) {
        let mut state = lock_unpoisoned(&self.state);
        state.release_count += 1;
        state.callback = None;
    }
}

/// Test-side control of one [`MockCodec`].
#[derive(Clone)]
pub struct MockCodecHandle {
    state: Arc<Mutex<MockCodecState>>,
}

impl MockCodecHandle {
    fn callback(&self) -> Option<Arc<dyn CodecCallback>> {
        lock_unpoisoned(&self.state).callback.clone()
    }

    /// Announces input buffer `index` as free.  Returns `false` if the codec
    /// was never configured or has been released.
    pub fn offer_input_buffer(&self, index: usize) -> bool {
        match self.callback() {
            Some(callback) => {
                callback.on_input_buffer_available(index);
                true
            }
            None => false,
        }
    }

    /// Produces output buffer `index` holding `data`.
    pub fn emit_output(&self, index: usize, data: &[u8], presentation_time_us: i64, flags: u32) -> bool {
        let callback = {
            let mut state = lock_unpoisoned(&self.state);
            let Some(callback) = state.callback.clone() else {
                return false;
            };
            state.pending_outputs.insert(index, data.to_vec());
            callback
        };
        callback.on_output_buffer_available(
            index,
            BufferInfo {
                offset: 0,
                size: data.len(),
                presentation_time_us,
                flags,
            },
        );
        true
    }

    /// Reports an asynchronous codec failure.
    pub fn fail(&self, error: CodecError) -> bool {
        match self.callback() {
            Some(callback) => {
                callback.on_error(error);
                true
            }
            None => false,
        }
    }

    pub fn role(&self) -> Option<CodecRole> {
        lock_unpoisoned(&self.state).role
    }

    pub fn format(&self) -> Option<VideoFormat> {
        lock_unpoisoned(&self.state).format.clone()
    }

    pub fn is_started(&self) -> bool {
        lock_unpoisoned(&self.state).started
    }

    pub fn queued_inputs(&self) -> Vec<QueuedInput> {
        lock_unpoisoned(&self.state).queued_inputs.clone()
    }

    pub fn released_outputs(&self) -> Vec<(usize, bool)> {
        lock_unpoisoned(&self.state).released_outputs.clone()
    }

    pub fn end_of_stream_signalled(&self) -> bool {
        lock_unpoisoned(&self.state).end_of_stream_signalled
    }

    pub fn flush_count(&self) -> usize {
        lock_unpoisoned(&self.state).flush_count
    }

    pub fn stop_count(&self) -> usize {
        lock_unpoisoned(&self.state).stop_count
    }

    pub fn release_count(&self) -> usize {
        lock_unpoisoned(&self.state).release_count
    }
}

/// Factory recording a [`MockCodecHandle`] for every codec it creates.
#[derive(Clone, Default)]
pub struct MockCodecFactory {
    created: Arc<Mutex<Vec<MockCodecHandle>>>,
    fail_create: Arc<Mutex<bool>>,
}

impl MockCodecFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `create` call fail with `Unsupported`.
    pub fn set_fail_create(&self, fail: bool) {
        *lock_unpoisoned(&self.fail_create) = fail;
    }

    pub fn codecs(&self) -> Vec<MockCodecHandle> {
        lock_unpoisoned(&self.created).clone()
    }

    pub fn last(&self) -> Option<MockCodecHandle> {
        lock_unpoisoned(&self.created).last().cloned()
    }

    pub fn created_count(&self) -> usize {
        lock_unpoisoned(&self.created).len()
    }
}

impl CodecFactory for MockCodecFactory {
    fn create(&self, role: CodecRole, mime_type: &str) -> Result<Box<dyn VideoCodec>, CodecError> {
        if *lock_unpoisoned(&self.fail_create) {
            return Err(CodecError::Unsupported(mime_type.to_string()));
        }
        let (codec, handle) = MockCodec::new(role);
        lock_unpoisoned(&self.created).push(handle);
        Ok(Box::new(codec))
    }
}
