//! Caller-side handle of a queued stream.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use wavepipe_backends::{select_transfer, ControlDevice, PcmDevice, PcmError};
use wavepipe_rt::{Direction, PcmFormat, QueueError, StreamState, StreamTime, TimeFormat};

use crate::buffer::WaveBuffer;
use crate::config::EngineConfig;
use crate::device::{Command, DeviceEngine, Ring, StreamShared};
use crate::error::{EngineError, SubmitError};
use crate::feeder::BufferFeeder;
use crate::metrics::{MetricsSnapshot, StreamMetrics};
use crate::mixer::{MixerControl, VolumeReading};
use crate::recovery::ErrorRecovery;
use crate::rt::promote_current_thread;
use crate::sink::NotificationSink;

/// An open playback or capture stream.
///
/// Every method may be called from any thread. Transport commands block until
/// the engine thread has carried them out; [`StreamHandle::submit`] never
/// blocks.
pub struct StreamHandle {
    ring: Arc<Ring>,
    /// Serializes this handle's synchronous commands.
    sync_gate: Mutex<()>,
    shared: Arc<StreamShared>,
    format: PcmFormat,
    direction: Direction,
    hardware_id: String,
    mixer: Mutex<MixerControl>,
    volume_element: String,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamHandle {
    /// Validates `format` against the opened hardware and starts the engine
    /// thread. Nothing is started when the format is rejected.
    pub fn open(
        format: PcmFormat,
        pcm: Box<dyn PcmDevice>,
        control: Option<Box<dyn ControlDevice>>,
        sink: Box<dyn NotificationSink>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        format.validate()?;
        let params = pcm.params().clone();
        if params.format != format {
            return Err(EngineError::UnsupportedFormat(format!(
                "requested {format:?}, hardware negotiated {:?}",
                params.format
            )));
        }
        let transfer = select_transfer(config.transfer, &params).map_err(|err| match err {
            PcmError::NotSupported => EngineError::MmapUnsupported,
            other => EngineError::Hardware(other),
        })?;

        let direction = pcm.direction();
        let hardware_id = pcm.hardware_id().to_string();
        let metrics = Arc::new(StreamMetrics::new());
        let shared = Arc::new(StreamShared::new(Arc::clone(&metrics)));
        let ring = Arc::new(Ring::with_increment(config.ring_increment));
        let feeder = BufferFeeder::new(transfer, params.period_time());
        let recovery = ErrorRecovery::new(config.suspend_policy(), metrics);
        let engine = DeviceEngine::new(
            pcm,
            feeder,
            recovery,
            sink,
            Arc::clone(&ring),
            Arc::clone(&shared),
        );

        let priority = config.realtime_priority;
        let thread = thread::Builder::new()
            .name("wavepipe-engine".into())
            .spawn(move || {
                if let Some(priority) = priority {
                    promote_current_thread(priority);
                }
                engine.run();
            })
            .map_err(|err| EngineError::Thread(err.to_string()))?;

        tracing::info!(
            device = %hardware_id,
            ?direction,
            rate = format.sample_rate,
            channels = format.channels,
            "stream opened"
        );
        Ok(Self {
            ring,
            sync_gate: Mutex::new(()),
            shared,
            format,
            direction,
            hardware_id,
            mixer: Mutex::new(MixerControl::new(control)),
            volume_element: config.volume_element.clone(),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn start(&self) -> Result<(), EngineError> {
        self.send(Command::Start)
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        self.send(Command::Resume)
    }

    /// Stops the stream and returns every queued buffer as a forced
    /// completion before this call returns.
    pub fn reset(&self) -> Result<(), EngineError> {
        self.send(Command::Reset)
    }

    pub fn break_loop(&self) -> Result<(), EngineError> {
        self.send(Command::BreakLoop)
    }

    /// Closes the stream and joins the engine thread. Refused with
    /// [`EngineError::StillPlaying`] while buffers are queued.
    pub fn close(&self) -> Result<(), EngineError> {
        self.send(Command::Close)?;
        self.join();
        tracing::info!(device = %self.hardware_id, "stream closed");
        Ok(())
    }

    /// Hands `buffer` to the engine. On refusal the buffer comes back inside
    /// the error.
    pub fn submit(&self, mut buffer: WaveBuffer) -> Result<(), SubmitError> {
        if !buffer.is_prepared() {
            return Err(SubmitError::new(EngineError::BufferNotPrepared, buffer));
        }
        if buffer.is_queued() {
            return Err(SubmitError::new(EngineError::BufferStillQueued, buffer));
        }
        let block_align = self.format.block_align();
        if buffer.len() % block_align != 0 {
            let error = EngineError::UnalignedBuffer {
                len: buffer.len(),
                block_align,
            };
            return Err(SubmitError::new(error, buffer));
        }

        buffer.mark_queued();
        self.ring.post(Command::Submit(buffer)).map_err(|rejected| {
            let error = self.queue_error(rejected.reason);
            let mut buffer = rejected
                .command
                .into_buffer()
                .unwrap_or_else(|| WaveBuffer::new(Vec::new()));
            buffer.unmark_queued();
            SubmitError::new(error, buffer)
        })
    }

    /// Position of the stream, refreshed from the hardware first.
    pub fn position(&self, format: TimeFormat) -> Result<StreamTime, EngineError> {
        self.send(Command::UpdatePosition)?;
        Ok(self.format.to_time(self.shared.confirmed(), format))
    }

    pub fn volume(&self) -> Result<VolumeReading, EngineError> {
        self.ensure_open()?;
        self.mixer.lock().get(&self.volume_element)
    }

    pub fn set_volume(&self, left: Option<u16>, right: Option<u16>) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.mixer.lock().set(&self.volume_element, left, right)
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.shared.is_gone() {
            Err(EngineError::DeviceGone)
        } else if self.ring.is_closed() {
            Err(EngineError::NotOpen)
        } else {
            Ok(())
        }
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        let _gate = self.sync_gate.lock();
        match self.ring.send_wait(command) {
            Ok(reply) => reply,
            Err(err) => Err(self.queue_error(err)),
        }
    }

    fn queue_error(&self, err: QueueError) -> EngineError {
        match err {
            QueueError::Closed | QueueError::Disconnected if self.shared.is_gone() => {
                EngineError::DeviceGone
            }
            QueueError::Closed => EngineError::NotOpen,
            QueueError::Disconnected => EngineError::DeviceGone,
            other => EngineError::Queue(other),
        }
    }

    fn join(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if let Err(err) = thread.join() {
            tracing::error!(?err, "engine thread panicked");
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !self.ring.is_closed() {
            if let Err(err) = self.reset().and_then(|()| self.close()) {
                tracing::warn!(%err, "stream dropped while open, abandoning it");
                self.ring.close();
            }
        }
        self.join();
    }
}
