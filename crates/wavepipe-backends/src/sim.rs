//! Software PCM and control devices.
//!
//! [`SimulatedPcm`] behaves like a hardware ring buffer whose hardware pointer
//! moves with a clock: either wall time or a [`ManualClock`] stepped by tests.
//! Playback drains the ring into an optional tap, capture produces a
//! deterministic byte pattern. Faults (underrun, suspend, fatal disconnect,
//! resume returning "again") are injected through a [`SimProbe`] while the
//! device is owned by an engine thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wavepipe_rt::{Direction, PcmFormat};

use crate::{
    ControlDevice, ControlError, ElementInfo, HwParams, PcmDevice, PcmError, PcmState, Result,
};

/// Shared clock a test advances by hand.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone)]
pub enum SimClock {
    Realtime(Instant),
    Manual(ManualClock),
}

impl SimClock {
    pub fn realtime() -> Self {
        SimClock::Realtime(Instant::now())
    }

    fn elapsed(&self) -> Duration {
        match self {
            SimClock::Realtime(origin) => origin.elapsed(),
            SimClock::Manual(clock) => clock.elapsed(),
        }
    }

    fn is_realtime(&self) -> bool {
        matches!(self, SimClock::Realtime(_))
    }
}

/// Content produced by a simulated capture device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CapturePattern {
    #[default]
    Silence,
    /// Byte `n` of the stream has the value `n % 256`.
    Ramp,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub hardware_id: String,
    pub period_frames: usize,
    pub periods: usize,
    pub can_pause: bool,
    pub can_resume: bool,
    pub mmap: bool,
    pub clock: SimClock,
    /// Keep a copy of every played byte for inspection.
    pub tap: bool,
    pub capture: CapturePattern,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            hardware_id: "sim:0".into(),
            period_frames: 1024,
            periods: 4,
            can_pause: true,
            can_resume: true,
            mmap: true,
            clock: SimClock::realtime(),
            tap: true,
            capture: CapturePattern::Silence,
        }
    }
}

/// Counters describing what happened to a simulated device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub xruns: u32,
    pub suspends: u32,
    pub prepares: u32,
    pub starts: u32,
    pub resumes: u32,
    pub frames_played: u64,
}

#[derive(Debug, Default)]
struct PendingFaults {
    underrun: bool,
    suspend: bool,
    fatal: bool,
    resume_again: u32,
}

#[derive(Debug)]
struct SimShared {
    played: Vec<u8>,
    faults: PendingFaults,
    stats: SimStats,
    state: PcmState,
}

/// Observation and fault-injection handle for a [`SimulatedPcm`].
#[derive(Clone)]
pub struct SimProbe {
    shared: Arc<Mutex<SimShared>>,
}

impl SimProbe {
    /// Bytes the simulated hardware has played so far.
    pub fn played(&self) -> Vec<u8> {
        self.shared.lock().played.clone()
    }

    pub fn played_len(&self) -> usize {
        self.shared.lock().played.len()
    }

    pub fn stats(&self) -> SimStats {
        self.shared.lock().stats
    }

    /// State observed by the device's most recent operation.
    pub fn state(&self) -> PcmState {
        self.shared.lock().state
    }

    /// Plays out whatever is queued and enters the xrun state at the next
    /// operation performed while running.
    pub fn inject_underrun(&self) {
        self.shared.lock().faults.underrun = true;
    }

    pub fn inject_suspend(&self) {
        self.shared.lock().faults.suspend = true;
    }

    /// Disconnects the device; every later call fails.
    pub fn inject_fatal(&self) {
        self.shared.lock().faults.fatal = true;
    }

    /// Makes the next `count` resume attempts report "again".
    pub fn set_resume_again(&self, count: u32) {
        self.shared.lock().faults.resume_again = count;
    }
}

pub struct SimulatedPcm {
    params: HwParams,
    direction: Direction,
    hardware_id: String,
    clock: SimClock,
    tap: bool,
    capture: CapturePattern,
    ring: Vec<u8>,
    /// Application pointer, in frames since open.
    appl: u64,
    /// Hardware pointer, in frames since open.
    hw: u64,
    clock_frames: u64,
    state: PcmState,
    suspended_from: PcmState,
    shared: Arc<Mutex<SimShared>>,
}

impl SimulatedPcm {
    pub fn new(direction: Direction, format: PcmFormat, config: SimConfig) -> Self {
        let period_frames = config.period_frames.max(1);
        let buffer_frames = period_frames * config.periods.max(2);
        let params = HwParams {
            format,
            period_frames,
            buffer_frames,
            can_pause: config.can_pause,
            can_resume: config.can_resume,
            mmap: config.mmap,
        };
        let mut pcm = Self {
            ring: vec![format.encoding.silence_byte(); params.buffer_bytes()],
            params,
            direction,
            hardware_id: config.hardware_id,
            clock: config.clock,
            tap: config.tap,
            capture: config.capture,
            appl: 0,
            hw: 0,
            clock_frames: 0,
            state: PcmState::Prepared,
            suspended_from: PcmState::Prepared,
            shared: Arc::new(Mutex::new(SimShared {
                played: Vec::new(),
                faults: PendingFaults::default(),
                stats: SimStats::default(),
                state: PcmState::Prepared,
            })),
        };
        pcm.clock_frames = pcm.clock_now_frames();
        pcm
    }

    pub fn playback(format: PcmFormat, config: SimConfig) -> Self {
        Self::new(Direction::Playback, format, config)
    }

    pub fn capture(format: PcmFormat, config: SimConfig) -> Self {
        Self::new(Direction::Capture, format, config)
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    fn align(&self) -> usize {
        self.params.format.block_align()
    }

    fn clock_now_frames(&self) -> u64 {
        let nanos = self.clock.elapsed().as_nanos();
        (nanos * u128::from(self.params.format.sample_rate) / 1_000_000_000) as u64
    }

    fn frames_duration(&self, frames: u64) -> Duration {
        let rate = u64::from(self.params.format.sample_rate.max(1));
        Duration::from_nanos(frames * 1_000_000_000 / rate)
    }

    fn set_state(&mut self, state: PcmState) {
        self.state = state;
        self.shared.lock().state = state;
    }

    fn queued(&self) -> u64 {
        match self.direction {
            Direction::Playback => self.appl - self.hw,
            Direction::Capture => self.hw - self.appl,
        }
    }

    /// Moves the hardware pointer to the current clock time and applies any
    /// injected faults.
    fn sync(&mut self) {
        let now = self.clock_now_frames();
        let delta = now.saturating_sub(self.clock_frames);
        self.clock_frames = now;
        if delta > 0 && matches!(self.state, PcmState::Running | PcmState::Draining) {
            self.advance(delta);
        }
        self.apply_faults();
    }

    fn advance(&mut self, delta: u64) {
        match self.direction {
            Direction::Playback => {
                let queued = self.queued();
                self.play_out(delta.min(queued));
                if delta >= queued {
                    if self.state == PcmState::Draining {
                        self.set_state(PcmState::Setup);
                    } else {
                        self.enter_xrun();
                    }
                }
            }
            Direction::Capture => {
                self.hw += delta;
                if self.queued() > self.params.buffer_frames as u64 {
                    self.enter_xrun();
                }
            }
        }
    }

    fn enter_xrun(&mut self) {
        tracing::trace!(hw = self.hw, appl = self.appl, "simulated xrun");
        self.shared.lock().stats.xruns += 1;
        self.set_state(PcmState::Xrun);
    }

    fn play_out(&mut self, frames: u64) {
        if frames == 0 {
            return;
        }
        let align = self.align();
        let mut shared = self.shared.lock();
        if self.tap {
            let ring_len = self.ring.len();
            let start = (self.hw % self.params.buffer_frames as u64) as usize * align;
            let bytes = frames as usize * align;
            let first = bytes.min(ring_len - start);
            shared.played.extend_from_slice(&self.ring[start..start + first]);
            shared.played.extend_from_slice(&self.ring[..bytes - first]);
        }
        shared.stats.frames_played += frames;
        drop(shared);
        self.hw += frames;
    }

    fn apply_faults(&mut self) {
        let (fatal, underrun, suspend) = {
            let mut shared = self.shared.lock();
            let running = self.state == PcmState::Running;
            let suspendable = matches!(
                self.state,
                PcmState::Running | PcmState::Prepared | PcmState::Paused
            );
            let fatal = std::mem::take(&mut shared.faults.fatal);
            let underrun = running && std::mem::take(&mut shared.faults.underrun);
            let suspend = suspendable && !underrun && std::mem::take(&mut shared.faults.suspend);
            (fatal, underrun, suspend)
        };
        if fatal {
            self.set_state(PcmState::Disconnected);
        } else if underrun {
            if self.direction == Direction::Playback {
                self.play_out(self.queued());
            }
            self.enter_xrun();
        } else if suspend {
            self.suspended_from = self.state;
            self.shared.lock().stats.suspends += 1;
            self.set_state(PcmState::Suspended);
        }
    }

    fn check_io(&self) -> Result<()> {
        match self.state {
            PcmState::Xrun => Err(PcmError::Underrun),
            PcmState::Suspended => Err(PcmError::Suspended),
            PcmState::Disconnected => Err(PcmError::Disconnected),
            PcmState::Setup => Err(PcmError::BadState(PcmState::Setup)),
            _ => Ok(()),
        }
    }

    fn available(&self) -> usize {
        match self.direction {
            Direction::Playback => self.params.buffer_frames - self.queued() as usize,
            Direction::Capture => self.queued() as usize,
        }
    }

    fn pattern_byte(&self, absolute: u64) -> u8 {
        match self.capture {
            CapturePattern::Silence => self.params.format.encoding.silence_byte(),
            CapturePattern::Ramp => (absolute % 256) as u8,
        }
    }

    fn fill_capture(&self, data: &mut [u8], first_frame: u64) {
        let base = first_frame * self.align() as u64;
        for (index, byte) in data.iter_mut().enumerate() {
            *byte = self.pattern_byte(base + index as u64);
        }
    }
}

impl PcmDevice for SimulatedPcm {
    fn params(&self) -> &HwParams {
        &self.params
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    fn state(&mut self) -> PcmState {
        self.sync();
        self.state
    }

    fn avail(&mut self) -> Result<usize> {
        self.sync();
        self.check_io()?;
        Ok(self.available())
    }

    fn delay(&mut self) -> Result<i64> {
        self.sync();
        self.check_io()?;
        Ok(self.queued() as i64)
    }

    fn prepare(&mut self) -> Result<()> {
        self.sync();
        if self.state == PcmState::Disconnected {
            return Err(PcmError::Disconnected);
        }
        match self.direction {
            Direction::Playback => self.appl = self.hw,
            Direction::Capture => self.hw = self.appl,
        }
        self.shared.lock().stats.prepares += 1;
        self.set_state(PcmState::Prepared);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.sync();
        if self.state != PcmState::Prepared {
            self.check_io()?;
            return Err(PcmError::BadState(self.state));
        }
        self.clock_frames = self.clock_now_frames();
        self.shared.lock().stats.starts += 1;
        self.set_state(PcmState::Running);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.sync();
        if self.state != PcmState::Suspended {
            return Err(PcmError::BadState(self.state));
        }
        {
            let mut shared = self.shared.lock();
            if shared.faults.resume_again > 0 {
                shared.faults.resume_again -= 1;
                return Err(PcmError::Again);
            }
        }
        if !self.params.can_resume {
            return Err(PcmError::NotSupported);
        }
        self.clock_frames = self.clock_now_frames();
        self.shared.lock().stats.resumes += 1;
        let resumed = self.suspended_from;
        self.set_state(resumed);
        Ok(())
    }

    fn pause(&mut self, enable: bool) -> Result<()> {
        if !self.params.can_pause {
            return Err(PcmError::NotSupported);
        }
        self.sync();
        match (enable, self.state) {
            (true, PcmState::Running) => self.set_state(PcmState::Paused),
            (false, PcmState::Paused) => self.set_state(PcmState::Running),
            (_, state) => {
                self.check_io()?;
                return Err(PcmError::BadState(state));
            }
        }
        Ok(())
    }

    fn drop_frames(&mut self) -> Result<()> {
        self.sync();
        if self.state == PcmState::Disconnected {
            return Err(PcmError::Disconnected);
        }
        match self.direction {
            Direction::Playback => self.appl = self.hw,
            Direction::Capture => self.hw = self.appl,
        }
        self.set_state(PcmState::Setup);
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.sync();
        match self.state {
            PcmState::Disconnected => return Err(PcmError::Disconnected),
            PcmState::Suspended => return Err(PcmError::Suspended),
            _ => {}
        }
        if self.direction == Direction::Playback
            && matches!(self.state, PcmState::Running | PcmState::Prepared)
        {
            let remaining = self.queued();
            if self.clock.is_realtime() && self.state == PcmState::Running {
                thread::sleep(self.frames_duration(remaining));
            }
            self.play_out(remaining);
            self.clock_frames = self.clock_now_frames();
        }
        self.set_state(PcmState::Setup);
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        self.sync();
        self.check_io()?;
        let period = self.params.period_frames;
        if self.available() >= period {
            return Ok(true);
        }
        let nap = if self.clock.is_realtime() && self.state == PcmState::Running {
            let missing = (period - self.available()) as u64;
            self.frames_duration(missing).min(timeout)
        } else {
            timeout.min(Duration::from_millis(1))
        };
        thread::sleep(nap);
        self.sync();
        self.check_io()?;
        Ok(self.available() >= period)
    }

    fn writei(&mut self, data: &[u8]) -> Result<usize> {
        if self.direction != Direction::Playback {
            return Err(PcmError::BadState(self.state));
        }
        self.sync();
        self.check_io()?;
        if self.state == PcmState::Paused {
            return Err(PcmError::BadState(self.state));
        }
        let align = self.align();
        let wanted = data.len() / align;
        let frames = wanted.min(self.available());
        if frames == 0 {
            return if wanted == 0 { Ok(0) } else { Err(PcmError::Again) };
        }
        let ring_len = self.ring.len();
        let start = (self.appl % self.params.buffer_frames as u64) as usize * align;
        let bytes = frames * align;
        let first = bytes.min(ring_len - start);
        self.ring[start..start + first].copy_from_slice(&data[..first]);
        self.ring[..bytes - first].copy_from_slice(&data[first..bytes]);
        self.appl += frames as u64;
        Ok(frames)
    }

    fn readi(&mut self, data: &mut [u8]) -> Result<usize> {
        if self.direction != Direction::Capture {
            return Err(PcmError::BadState(self.state));
        }
        self.sync();
        self.check_io()?;
        let align = self.align();
        let wanted = data.len() / align;
        let frames = wanted.min(self.available());
        if frames == 0 {
            return if wanted == 0 { Ok(0) } else { Err(PcmError::Again) };
        }
        self.fill_capture(&mut data[..frames * align], self.appl);
        self.appl += frames as u64;
        Ok(frames)
    }

    fn mmap_begin(&mut self, frames: usize) -> Result<(usize, usize)> {
        if !self.params.mmap {
            return Err(PcmError::NotSupported);
        }
        self.sync();
        self.check_io()?;
        let offset = (self.appl % self.params.buffer_frames as u64) as usize;
        let mapped = frames
            .min(self.available())
            .min(self.params.buffer_frames - offset);
        if self.direction == Direction::Capture && mapped > 0 {
            let align = self.align();
            let mut region = std::mem::take(&mut self.ring);
            self.fill_capture(
                &mut region[offset * align..(offset + mapped) * align],
                self.appl,
            );
            self.ring = region;
        }
        Ok((offset, mapped))
    }

    fn mmap_area_mut(&mut self, offset: usize, frames: usize) -> Result<&mut [u8]> {
        if offset + frames > self.params.buffer_frames {
            return Err(PcmError::Io(format!(
                "mapped region {offset}+{frames} exceeds ring of {} frames",
                self.params.buffer_frames
            )));
        }
        let align = self.align();
        Ok(&mut self.ring[offset * align..(offset + frames) * align])
    }

    fn mmap_commit(&mut self, offset: usize, frames: usize) -> Result<usize> {
        let expected = (self.appl % self.params.buffer_frames as u64) as usize;
        if offset != expected {
            return Err(PcmError::Io(format!(
                "commit at frame {offset}, application pointer at {expected}"
            )));
        }
        let frames = frames.min(self.available());
        self.appl += frames as u64;
        Ok(frames)
    }
}

#[derive(Debug, Clone)]
struct SimElement {
    info: ElementInfo,
    values: Vec<i64>,
}

/// In-memory control interface. Clones share the same elements.
#[derive(Debug, Clone, Default)]
pub struct SimulatedControl {
    elements: Arc<Mutex<HashMap<String, SimElement>>>,
}

impl SimulatedControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an integer element with every slot set to `initial`.
    pub fn with_element(self, name: &str, info: ElementInfo, initial: i64) -> Self {
        let values = vec![initial.clamp(info.min, info.max); info.count];
        self.elements
            .lock()
            .insert(name.to_string(), SimElement { info, values });
        self
    }

    /// Current raw values of `name`, if it exists.
    pub fn values(&self, name: &str) -> Option<Vec<i64>> {
        self.elements
            .lock()
            .get(name)
            .map(|element| element.values.clone())
    }
}

impl ControlDevice for SimulatedControl {
    fn element_info(&self, name: &str) -> std::result::Result<ElementInfo, ControlError> {
        self.elements
            .lock()
            .get(name)
            .map(|element| element.info)
            .ok_or_else(|| ControlError::ElementNotFound(name.to_string()))
    }

    fn read_integers(&self, name: &str) -> std::result::Result<Vec<i64>, ControlError> {
        self.values(name)
            .ok_or_else(|| ControlError::ElementNotFound(name.to_string()))
    }

    fn write_integers(
        &mut self,
        name: &str,
        values: &[i64],
    ) -> std::result::Result<(), ControlError> {
        let mut elements = self.elements.lock();
        let element = elements
            .get_mut(name)
            .ok_or_else(|| ControlError::ElementNotFound(name.to_string()))?;
        let (min, max) = (element.info.min, element.info.max);
        for (slot, value) in element.values.iter_mut().zip(values) {
            *slot = (*value).clamp(min, max);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavepipe_rt::SampleEncoding;

    fn manual(config: SimConfig) -> (SimConfig, ManualClock) {
        let clock = ManualClock::new();
        (
            SimConfig {
                clock: SimClock::Manual(clock.clone()),
                ..config
            },
            clock,
        )
    }

    fn format() -> PcmFormat {
        PcmFormat::new(SampleEncoding::S16Le, 2, 48_000)
    }

    #[test]
    fn hardware_pointer_follows_the_clock() {
        let (config, clock) = manual(SimConfig {
            period_frames: 480,
            periods: 4,
            ..SimConfig::default()
        });
        let mut pcm = SimulatedPcm::playback(format(), config);
        let probe = pcm.probe();
        let data: Vec<u8> = (0..1920 * 4).map(|index| index as u8).collect();
        assert_eq!(pcm.writei(&data).unwrap(), 1920);
        assert_eq!(pcm.avail().unwrap(), 0);
        pcm.start().unwrap();

        clock.advance(Duration::from_millis(10));
        assert_eq!(pcm.delay().unwrap(), 1440);
        assert_eq!(pcm.avail().unwrap(), 480);
        assert_eq!(probe.played(), data[..480 * 4].to_vec());
    }

    #[test]
    fn running_dry_is_an_underrun() {
        let (config, clock) = manual(SimConfig::default());
        let mut pcm = SimulatedPcm::playback(format(), config);
        pcm.writei(&[0; 400]).unwrap();
        pcm.start().unwrap();
        clock.advance(Duration::from_millis(50));
        assert_eq!(pcm.state(), PcmState::Xrun);
        assert_eq!(pcm.writei(&[0; 4]), Err(PcmError::Underrun));
        pcm.prepare().unwrap();
        assert_eq!(pcm.writei(&[0; 4]).unwrap(), 1);
        assert_eq!(pcm.probe().stats().xruns, 1);
    }

    #[test]
    fn suspend_resumes_after_again() {
        let (config, _clock) = manual(SimConfig::default());
        let mut pcm = SimulatedPcm::playback(format(), config);
        let probe = pcm.probe();
        pcm.writei(&[0; 64]).unwrap();
        pcm.start().unwrap();
        probe.set_resume_again(2);
        probe.inject_suspend();
        assert_eq!(pcm.avail(), Err(PcmError::Suspended));
        assert_eq!(pcm.resume(), Err(PcmError::Again));
        assert_eq!(pcm.resume(), Err(PcmError::Again));
        pcm.resume().unwrap();
        assert_eq!(pcm.state(), PcmState::Running);
    }

    #[test]
    fn mmap_regions_stop_at_the_ring_end() {
        let (config, clock) = manual(SimConfig {
            period_frames: 4,
            periods: 2,
            ..SimConfig::default()
        });
        let mut pcm = SimulatedPcm::playback(format(), config);
        let (offset, frames) = pcm.mmap_begin(6).unwrap();
        assert_eq!((offset, frames), (0, 6));
        pcm.mmap_area_mut(offset, frames).unwrap().fill(1);
        pcm.mmap_commit(offset, frames).unwrap();
        pcm.start().unwrap();
        // 4 frames at 48 kHz.
        clock.advance(Duration::from_nanos(83_334));
        let (offset, frames) = pcm.mmap_begin(8).unwrap();
        assert_eq!((offset, frames), (6, 2));
        assert!(pcm.mmap_commit(0, 1).is_err());
    }

    #[test]
    fn capture_produces_the_ramp() {
        let (config, clock) = manual(SimConfig {
            capture: CapturePattern::Ramp,
            ..SimConfig::default()
        });
        let mut pcm = SimulatedPcm::capture(format(), config);
        let mut data = [0u8; 16];
        assert_eq!(pcm.readi(&mut data), Err(PcmError::Again));
        pcm.start().unwrap();
        clock.advance(Duration::from_millis(1));
        assert_eq!(pcm.readi(&mut data).unwrap(), 4);
        assert_eq!(data.to_vec(), (0u8..16).collect::<Vec<_>>());
    }

    #[test]
    fn control_clamps_written_values() {
        let mut control = SimulatedControl::new().with_element(
            "Master",
            ElementInfo {
                min: 0,
                max: 31,
                step: 1,
                count: 2,
            },
            10,
        );
        control.write_integers("Master", &[40, -3]).unwrap();
        assert_eq!(control.read_integers("Master").unwrap(), vec![31, 0]);
        assert!(matches!(
            control.element_info("Missing"),
            Err(ControlError::ElementNotFound(_))
        ));
    }
}
