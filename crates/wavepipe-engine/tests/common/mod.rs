#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use wavepipe_backends::{ManualClock, SimClock, SimConfig, SimProbe, SimulatedControl, SimulatedPcm};
use wavepipe_engine::{
    ChannelSink, Direction, EngineConfig, PcmFormat, StreamEvent, StreamHandle, WaveBuffer,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct Rig {
    pub handle: StreamHandle,
    pub events: Receiver<StreamEvent>,
    pub probe: SimProbe,
    pub clock: Option<ManualClock>,
}

pub struct RigOptions {
    pub direction: Direction,
    pub period_frames: usize,
    pub periods: usize,
    pub can_pause: bool,
    pub manual_clock: bool,
    pub sim: SimConfig,
    pub control: Option<SimulatedControl>,
    pub config: EngineConfig,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            direction: Direction::Playback,
            period_frames: 256,
            periods: 8,
            can_pause: true,
            manual_clock: true,
            sim: SimConfig::default(),
            control: None,
            config: EngineConfig::default(),
        }
    }
}

impl Rig {
    pub fn open(options: RigOptions) -> Self {
        let clock = options.manual_clock.then(ManualClock::new);
        let config = SimConfig {
            period_frames: options.period_frames,
            periods: options.periods,
            can_pause: options.can_pause,
            clock: match &clock {
                Some(clock) => SimClock::Manual(clock.clone()),
                None => SimClock::realtime(),
            },
            ..options.sim
        };
        let pcm = SimulatedPcm::new(options.direction, PcmFormat::cd(), config);
        let probe = pcm.probe();
        let (sink, events) = ChannelSink::new();
        let handle = StreamHandle::open(
            PcmFormat::cd(),
            Box::new(pcm),
            options
                .control
                .map(|control| Box::new(control) as Box<dyn wavepipe_backends::ControlDevice>),
            Box::new(sink),
            &options.config,
        )
        .expect("open stream");
        match events.recv_timeout(TIMEOUT).expect("opened event") {
            StreamEvent::Opened => {}
            other => panic!("expected Opened, got {other:?}"),
        }
        Self {
            handle,
            events,
            probe,
            clock,
        }
    }

    pub fn playback() -> Self {
        Self::open(RigOptions::default())
    }

    /// Advances the simulated hardware clock.
    pub fn advance(&self, by: Duration) {
        self.clock.as_ref().expect("manual clock").advance(by);
    }

    /// Waits for `count` completions and returns their user tags and forced
    /// flags in arrival order.
    pub fn completions(&self, count: usize) -> Vec<(u64, bool)> {
        self.completed_buffers(count)
            .into_iter()
            .map(|(buffer, forced)| (buffer.user(), forced))
            .collect()
    }

    pub fn completed_buffers(&self, count: usize) -> Vec<(WaveBuffer, bool)> {
        let mut seen = Vec::new();
        while seen.len() < count {
            match self.events.recv_timeout(TIMEOUT).expect("completion") {
                StreamEvent::BufferCompleted { buffer, forced } => seen.push((buffer, forced)),
                StreamEvent::Opened => {}
                StreamEvent::Closed => panic!("stream closed after {} completions", seen.len()),
            }
        }
        seen
    }

    /// Steps the clock one `step` at a time until `count` buffers have
    /// completed. Runs the hardware faster than the engine refills it, so
    /// underruns are expected along the way.
    pub fn pump(&self, count: usize, step: Duration) -> Vec<(WaveBuffer, bool)> {
        let deadline = Instant::now() + TIMEOUT;
        let mut seen = Vec::new();
        while seen.len() < count {
            assert!(
                Instant::now() < deadline,
                "only {} of {count} buffers completed",
                seen.len()
            );
            self.advance(step);
            match self.events.recv_timeout(Duration::from_millis(2)) {
                Ok(StreamEvent::BufferCompleted { buffer, forced }) => seen.push((buffer, forced)),
                Ok(StreamEvent::Opened) | Err(RecvTimeoutError::Timeout) => {}
                Ok(StreamEvent::Closed) => panic!("stream closed while pumping"),
                Err(RecvTimeoutError::Disconnected) => panic!("engine thread gone"),
            }
        }
        seen
    }

    /// Events already delivered, without waiting.
    pub fn pending_events(&self) -> Vec<StreamEvent> {
        self.events.try_iter().collect()
    }
}

/// A prepared buffer of `len` bytes, every byte set to `user`.
pub fn prepared(len: usize, user: u64) -> WaveBuffer {
    let mut buffer = WaveBuffer::new(vec![user as u8; len]).with_user(user);
    buffer.prepare().expect("prepare");
    buffer
}

pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Clock time for `frames` frames at 44.1 kHz, rounded up.
pub fn frames(frames: u64) -> Duration {
    Duration::from_nanos((frames * 1_000_000_000).div_ceil(44_100))
}
