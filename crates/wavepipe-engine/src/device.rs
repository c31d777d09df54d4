//! The per-stream engine thread and its state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wavepipe_backends::{PcmDevice, PcmError, PcmState};
use wavepipe_rt::{
    decode_state, encode_state, CommandRing, CompletionSignal, Direction, Envelope, PcmFormat,
    PositionClock, StreamState,
};

use crate::buffer::WaveBuffer;
use crate::error::EngineError;
use crate::feeder::BufferFeeder;
use crate::metrics::StreamMetrics;
use crate::notify::NotificationWalker;
use crate::queue::BufferQueue;
use crate::recovery::{classify, ErrorClass, ErrorRecovery};
use crate::sink::{NotificationSink, StreamEvent};

/// Commands sent from a [`crate::StreamHandle`] to its engine thread.
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Pause,
    Resume,
    Reset,
    Close,
    BreakLoop,
    UpdatePosition,
    Submit(WaveBuffer),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Reset => "reset",
            Command::Close => "close",
            Command::BreakLoop => "break-loop",
            Command::UpdatePosition => "update-position",
            Command::Submit(_) => "submit",
        }
    }

    fn is_submit(&self) -> bool {
        matches!(self, Command::Submit(_))
    }

    pub fn into_buffer(self) -> Option<WaveBuffer> {
        match self {
            Command::Submit(buffer) => Some(buffer),
            _ => None,
        }
    }
}

pub(crate) type Reply = Result<(), EngineError>;
pub(crate) type Ring = CommandRing<Command, Reply>;

/// State the engine thread publishes for the caller side.
#[derive(Debug)]
pub(crate) struct StreamShared {
    state: AtomicU8,
    confirmed: AtomicU64,
    gone: AtomicBool,
    pub metrics: Arc<StreamMetrics>,
}

impl StreamShared {
    pub fn new(metrics: Arc<StreamMetrics>) -> Self {
        Self {
            state: AtomicU8::new(encode_state(StreamState::Stopped)),
            confirmed: AtomicU64::new(0),
            gone: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn state(&self) -> StreamState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed.load(Ordering::Acquire)
    }

    /// Whether the engine exited after a fatal hardware error.
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }
}

enum Flow {
    Continue,
    Exit,
}

enum Pass {
    Sleep(Option<Duration>),
    Exit,
}

fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn reply_to(signal: Option<CompletionSignal<Reply>>, reply: Reply) {
    if let Some(signal) = signal {
        signal.complete(reply);
    }
}

pub(crate) struct DeviceEngine {
    pcm: Box<dyn PcmDevice>,
    direction: Direction,
    state: StreamState,
    queue: BufferQueue,
    clock: PositionClock,
    feeder: BufferFeeder,
    walker: NotificationWalker,
    recovery: ErrorRecovery,
    sink: Box<dyn NotificationSink>,
    ring: Arc<Ring>,
    shared: Arc<StreamShared>,
    /// The hardware is held by a native pause rather than stopped.
    hw_paused: bool,
}

impl DeviceEngine {
    pub fn new(
        pcm: Box<dyn PcmDevice>,
        feeder: BufferFeeder,
        recovery: ErrorRecovery,
        sink: Box<dyn NotificationSink>,
        ring: Arc<Ring>,
        shared: Arc<StreamShared>,
    ) -> Self {
        let direction = pcm.direction();
        let format: PcmFormat = pcm.params().format;
        Self {
            direction,
            state: StreamState::Stopped,
            queue: BufferQueue::new(direction),
            clock: PositionClock::new(direction, format.block_align()),
            walker: NotificationWalker::new(&format),
            pcm,
            feeder,
            recovery,
            sink,
            ring,
            shared,
            hw_paused: false,
        }
    }

    /// Runs the engine until the stream is closed or the hardware is lost.
    pub fn run(mut self) {
        tracing::debug!(
            device = self.pcm.hardware_id(),
            direction = ?self.direction,
            transfer = self.feeder.transfer_name(),
            "engine thread started"
        );
        self.sink.notify(StreamEvent::Opened);

        let mut sleep = None;
        loop {
            self.ring.block_until(sleep);
            if let Flow::Exit = self.process_commands() {
                break;
            }
            if self.ring.is_closed() {
                self.abandon();
                break;
            }
            if self.state != StreamState::Playing {
                sleep = None;
                continue;
            }
            match self.tick() {
                Ok(Pass::Sleep(next)) => sleep = next,
                Ok(Pass::Exit) => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }
        tracing::debug!(device = self.pcm.hardware_id(), "engine thread exiting");
    }

    fn process_commands(&mut self) -> Flow {
        while let Some(envelope) = self.ring.try_take() {
            if let Flow::Exit = self.dispatch(envelope) {
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    /// One pass while playing: position, feed, then completions.
    fn tick(&mut self) -> Result<Pass, PcmError> {
        self.update_position()?;
        let mut feed = self.feed()?;
        if feed.is_none() && self.ring.peek(Command::is_submit).unwrap_or(false) {
            // A buffer that arrived while feeding can go out right away.
            if let Some(envelope) = self.ring.try_take() {
                if let Flow::Exit = self.dispatch(envelope) {
                    return Ok(Pass::Exit);
                }
            }
            if self.state == StreamState::Playing && self.queue.has_play() {
                feed = self.feed()?;
            }
        }
        let notify = self.notify(false);
        Ok(Pass::Sleep(earliest(feed, notify)))
    }

    fn dispatch(&mut self, envelope: Envelope<Command, Reply>) -> Flow {
        let Envelope { command, signal } = envelope;
        if !command.is_submit() {
            tracing::debug!(command = command.name(), state = ?self.state, "engine command");
        }
        let outcome = match command {
            Command::Submit(buffer) => {
                self.enqueue(buffer);
                Ok(())
            }
            Command::Start => self.start(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Reset => self.reset(),
            Command::BreakLoop => {
                self.break_loop();
                Ok(())
            }
            Command::UpdatePosition => self.update_position(),
            Command::Close => return self.close(signal),
        };
        match outcome {
            Ok(()) => {
                reply_to(signal, Ok(()));
                Flow::Continue
            }
            Err(err) => {
                self.fail(err);
                reply_to(signal, Err(EngineError::DeviceGone));
                Flow::Exit
            }
        }
    }

    fn set_state(&mut self, state: StreamState) {
        self.state = state;
        self.shared
            .state
            .store(encode_state(state), Ordering::Release);
    }

    fn publish_position(&self) {
        self.shared
            .confirmed
            .store(self.clock.confirmed(), Ordering::Release);
    }

    fn enqueue(&mut self, buffer: WaveBuffer) {
        tracing::trace!(len = buffer.len(), queued = self.queue.len(), "buffer submitted");
        self.queue.push(buffer);
        if self.state == StreamState::Stopped && self.direction == Direction::Playback {
            self.set_state(StreamState::Playing);
        }
    }

    fn start(&mut self) -> Result<(), PcmError> {
        if self.state != StreamState::Stopped {
            return Ok(());
        }
        if self.pcm.state() == PcmState::Setup {
            self.pcm.prepare()?;
        }
        self.set_state(StreamState::Playing);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PcmError> {
        match self.state {
            StreamState::Playing => {}
            StreamState::Stopped => {
                // Keeps later submissions from starting playback.
                self.set_state(StreamState::Paused);
                return Ok(());
            }
            StreamState::Paused | StreamState::Closed => return Ok(()),
        }
        self.update_position()?;

        let can_pause = self.pcm.params().can_pause;
        if can_pause && self.pcm.state() == PcmState::Running {
            match self.pcm.pause(true) {
                Ok(()) => {
                    self.hw_paused = true;
                    self.set_state(StreamState::Paused);
                    return Ok(());
                }
                Err(err @ (PcmError::NotSupported | PcmError::BadState(_))) => {
                    tracing::debug!(?err, "native pause refused, stopping instead");
                }
                Err(err) => self.recovery.recover(self.pcm.as_mut(), err)?,
            }
        }

        self.pcm.drop_frames()?;
        if self.direction == Direction::Playback {
            let written = self.clock.transferred();
            let played = self.clock.confirmed();
            self.queue.rewind(written, played);
            let lost = self.clock.rewind_to_confirmed();
            tracing::debug!(lost, "stopped for pause, unplayed data will be written again");
        }
        self.set_state(StreamState::Paused);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PcmError> {
        if self.state != StreamState::Paused {
            return Ok(());
        }
        if std::mem::take(&mut self.hw_paused) {
            if let Err(err) = self.pcm.pause(false) {
                self.recovery.recover(self.pcm.as_mut(), err)?;
                if self.pcm.state() == PcmState::Paused {
                    self.pcm.pause(false)?;
                }
            }
        } else if matches!(self.pcm.state(), PcmState::Setup | PcmState::Xrun) {
            self.pcm.prepare()?;
        }
        self.set_state(StreamState::Playing);
        Ok(())
    }

    fn break_loop(&mut self) {
        if self.state == StreamState::Playing && self.queue.break_loop() {
            tracing::debug!("loop will end after the current pass");
        }
    }

    fn reset(&mut self) -> Result<(), PcmError> {
        self.update_position()?;
        self.notify(false);

        if let Err(err) = self.pcm.drop_frames() {
            if classify(&err) == ErrorClass::Fatal {
                return Err(err);
            }
            tracing::debug!(?err, "drop during reset");
        }
        self.notify(true);

        let stray = self.queue.clear();
        debug_assert!(stray.is_empty());
        self.clock.reset();
        self.publish_position();
        self.hw_paused = false;
        self.set_state(StreamState::Stopped);
        if let Err(err) = self.pcm.prepare() {
            self.recovery.recover(self.pcm.as_mut(), err)?;
        }

        for envelope in self.ring.drain() {
            self.discard(envelope, Ok(()));
        }
        Ok(())
    }

    fn close(&mut self, signal: Option<CompletionSignal<Reply>>) -> Flow {
        if !self.queue.is_empty() || !self.ring.is_empty() {
            tracing::warn!(queued = self.queue.len(), "close refused, buffers still queued");
            reply_to(signal, Err(EngineError::StillPlaying));
            return Flow::Continue;
        }
        if let Err(err) = self.pcm.drop_frames() {
            tracing::debug!(?err, "drop during close");
        }
        for envelope in self.ring.close() {
            self.discard(envelope, Err(EngineError::NotOpen));
        }
        self.set_state(StreamState::Closed);
        self.sink.notify(StreamEvent::Closed);
        reply_to(signal, Ok(()));
        Flow::Exit
    }

    /// Returns every queued and pending buffer after an unrecoverable error.
    fn fail(&mut self, err: PcmError) {
        tracing::error!(
            ?err,
            device = self.pcm.hardware_id(),
            queued = self.queue.len(),
            "hardware lost, returning all buffers"
        );
        self.shared.gone.store(true, Ordering::Release);
        let pending = self.ring.close();
        self.notify(true);
        for envelope in pending {
            self.discard(envelope, Err(EngineError::DeviceGone));
        }
        self.set_state(StreamState::Closed);
        self.sink.notify(StreamEvent::Closed);
    }

    /// The handle went away without closing the stream.
    fn abandon(&mut self) {
        tracing::warn!(queued = self.queue.len(), "command ring closed under a live stream");
        if let Err(err) = self.pcm.drop_frames() {
            tracing::debug!(?err, "drop during shutdown");
        }
        self.notify(true);
        self.set_state(StreamState::Closed);
        self.sink.notify(StreamEvent::Closed);
    }

    /// Completes a command that will never run. Buffers go back to the caller.
    fn discard(&mut self, envelope: Envelope<Command, Reply>, reply: Reply) {
        match envelope.complete(reply) {
            Command::Submit(mut buffer) => {
                buffer.mark_done();
                self.shared.metrics.add_completed();
                self.sink.notify(StreamEvent::BufferCompleted {
                    buffer,
                    forced: true,
                });
            }
            command => tracing::debug!(command = command.name(), "dropped pending command"),
        }
    }

    fn update_position(&mut self) -> Result<(), PcmError> {
        let delay = match self.pcm.state() {
            PcmState::Running | PcmState::Draining | PcmState::Paused | PcmState::Prepared => {
                match self.pcm.delay() {
                    Ok(delay) => delay,
                    Err(err) if classify(&err) == ErrorClass::Fatal => return Err(err),
                    Err(_) => 0,
                }
            }
            PcmState::Xrun | PcmState::Setup => 0,
            PcmState::Suspended => return Ok(()),
            PcmState::Disconnected => return Err(PcmError::Disconnected),
        };
        self.clock.update_from_delay(delay);
        self.publish_position();
        Ok(())
    }

    fn feed(&mut self) -> Result<Option<Duration>, PcmError> {
        let next = self.feeder.feed(
            self.pcm.as_mut(),
            &mut self.queue,
            &mut self.clock,
            &mut self.recovery,
            &self.shared.metrics,
        )?;
        self.publish_position();
        Ok(next)
    }

    fn notify(&mut self, force: bool) -> Option<Duration> {
        self.walker.walk(
            &mut self.queue,
            self.clock.confirmed(),
            force,
            self.sink.as_mut(),
            &self.shared.metrics,
        )
    }
}
