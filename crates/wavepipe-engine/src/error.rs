use std::fmt;

use thiserror::Error;
use wavepipe_backends::PcmError;
use wavepipe_rt::{FormatError, QueueError};

use crate::buffer::WaveBuffer;

/// Errors reported to callers of the stream, session and registry APIs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown device id {0}")]
    BadDeviceId(u64),
    #[error("device is not open")]
    NotOpen,
    #[error("device is gone after a fatal hardware error")]
    DeviceGone,
    #[error("buffer has not been prepared")]
    BufferNotPrepared,
    #[error("buffer is still queued")]
    BufferStillQueued,
    #[error("buffers are still playing")]
    StillPlaying,
    #[error("buffer length {len} is not a multiple of the {block_align} byte frame")]
    UnalignedBuffer { len: usize, block_align: usize },
    #[error("device {0} is already bound to a direct session")]
    DirectSessionBusy(String),
    #[error("device does not support memory-mapped access")]
    MmapUnsupported,
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("hardware error: {0}")]
    Hardware(#[from] PcmError),
    #[error("no mixer control available")]
    NoMixer,
    #[error("mixer element not found: {0}")]
    ElementNotFound(String),
    #[error("mixer error: {0}")]
    Mixer(String),
    #[error("command queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("failed to start engine thread: {0}")]
    Thread(String),
}

impl From<FormatError> for EngineError {
    fn from(err: FormatError) -> Self {
        EngineError::UnsupportedFormat(err.to_string())
    }
}

/// A refused submission. The buffer is handed back untouched.
pub struct SubmitError {
    pub error: EngineError,
    pub buffer: WaveBuffer,
}

impl SubmitError {
    pub fn new(error: EngineError, buffer: WaveBuffer) -> Self {
        Self { error, buffer }
    }

    pub fn into_buffer(self) -> WaveBuffer {
        self.buffer
    }
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("error", &self.error)
            .field("buffer_len", &self.buffer.len())
            .finish()
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer submission failed: {}", self.error)
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
