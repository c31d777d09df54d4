use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};
use crossbeam_queue::ArrayQueue;
use wavepipe_rt::{Direction, PcmFormat, SampleEncoding};

use super::{HwParams, PcmDevice, PcmError, PcmState, Result};

enum StreamControl {
    Play,
    Pause,
    Shutdown,
}

struct Shared {
    bytes: ArrayQueue<u8>,
    running: AtomicBool,
    starved: AtomicBool,
}

/// Playback PCM on top of a cpal output stream.
///
/// The cpal stream lives on its own thread because it cannot be moved across
/// threads on every platform; the engine talks to it through a byte queue and
/// a control channel.
pub struct CpalPcm {
    params: HwParams,
    hardware_id: String,
    shared: Arc<Shared>,
    control: Sender<StreamControl>,
    stream_thread: Option<JoinHandle<()>>,
    state: PcmState,
}

impl CpalPcm {
    pub fn open(
        device: Option<&str>,
        format: PcmFormat,
        period_frames: usize,
        periods: usize,
    ) -> Result<Self> {
        if !matches!(format.encoding, SampleEncoding::S16Le | SampleEncoding::F32Le) {
            return Err(PcmError::NotSupported);
        }
        let params = HwParams {
            format,
            period_frames,
            buffer_frames: period_frames * periods.max(2),
            can_pause: true,
            can_resume: false,
            mmap: false,
        };
        let shared = Arc::new(Shared {
            bytes: ArrayQueue::new(params.buffer_bytes().max(1)),
            running: AtomicBool::new(false),
            starved: AtomicBool::new(false),
        });

        let (control_tx, control_rx) = bounded::<StreamControl>(8);
        let (ready_tx, ready_rx) = bounded::<Result<String>>(1);
        let device_name = device.map(str::to_string);
        let stream_shared = Arc::clone(&shared);
        let stream_thread = thread::Builder::new()
            .name("wavepipe-cpal".into())
            .spawn(move || {
                let stream = match build_stream(device_name.as_deref(), format, stream_shared) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                for command in control_rx.iter() {
                    let outcome = match command {
                        StreamControl::Play => stream.play().map_err(|err| err.to_string()),
                        StreamControl::Pause => stream.pause().map_err(|err| err.to_string()),
                        StreamControl::Shutdown => break,
                    };
                    if let Err(err) = outcome {
                        tracing::error!(%err, "cpal stream control failed");
                    }
                }
            })
            .map_err(|err| PcmError::Io(err.to_string()))?;

        let hardware_id = ready_rx
            .recv()
            .map_err(|_| PcmError::Io("cpal stream thread exited".into()))??;
        tracing::info!(device = %hardware_id, "opened cpal playback stream");

        Ok(Self {
            params,
            hardware_id,
            shared,
            control: control_tx,
            stream_thread: Some(stream_thread),
            state: PcmState::Prepared,
        })
    }

    fn queued_frames(&self) -> usize {
        self.shared.bytes.len() / self.params.format.block_align()
    }

    fn clear(&self) {
        while self.shared.bytes.pop().is_some() {}
    }

    fn send(&self, command: StreamControl) -> Result<()> {
        self.control
            .send(command)
            .map_err(|_| PcmError::Disconnected)
    }

    fn refresh(&mut self) {
        if self.state == PcmState::Running && self.shared.starved.swap(false, Ordering::AcqRel) {
            self.state = PcmState::Xrun;
        }
    }

    fn check_io(&self) -> Result<()> {
        match self.state {
            PcmState::Xrun => Err(PcmError::Underrun),
            PcmState::Disconnected => Err(PcmError::Disconnected),
            PcmState::Setup => Err(PcmError::BadState(PcmState::Setup)),
            _ => Ok(()),
        }
    }
}

/// Opens the named output device, or the default one.
pub fn open_output(
    device: Option<&str>,
    format: PcmFormat,
    period_frames: usize,
    periods: usize,
) -> Result<Box<dyn PcmDevice>> {
    Ok(Box::new(CpalPcm::open(device, format, period_frames, periods)?))
}

fn build_stream(
    device: Option<&str>,
    format: PcmFormat,
    shared: Arc<Shared>,
) -> Result<(cpal::Stream, String)> {
    let host = cpal::default_host();
    let device = match device {
        Some(name) => host
            .output_devices()
            .map_err(|err| PcmError::Io(err.to_string()))?
            .find(|candidate| candidate.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| PcmError::Io(format!("device not found: {name}")))?,
        None => host
            .default_output_device()
            .ok_or_else(|| PcmError::Io("no default output device".into()))?,
    };
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let on_error = |err: cpal::StreamError| {
        tracing::error!("cpal stream error: {err}");
    };

    let stream = match format.encoding {
        SampleEncoding::S16Le => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                for sample in data.iter_mut() {
                    *sample = pop_sample::<2>(&shared)
                        .map(i16::from_le_bytes)
                        .unwrap_or(0);
                }
            },
            on_error,
            None,
        ),
        _ => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for sample in data.iter_mut() {
                    *sample = pop_sample::<4>(&shared)
                        .map(f32::from_le_bytes)
                        .unwrap_or(0.0);
                }
            },
            on_error,
            None,
        ),
    }
    .map_err(|err| PcmError::Io(err.to_string()))?;
    Ok((stream, name))
}

fn pop_sample<const N: usize>(shared: &Shared) -> Option<[u8; N]> {
    if shared.bytes.len() < N {
        if shared.running.load(Ordering::Acquire) {
            shared.starved.store(true, Ordering::Release);
        }
        return None;
    }
    let mut sample = [0u8; N];
    for byte in sample.iter_mut() {
        *byte = shared.bytes.pop()?;
    }
    Some(sample)
}

impl PcmDevice for CpalPcm {
    fn params(&self) -> &HwParams {
        &self.params
    }

    fn direction(&self) -> Direction {
        Direction::Playback
    }

    fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    fn state(&mut self) -> PcmState {
        self.refresh();
        self.state
    }

    fn avail(&mut self) -> Result<usize> {
        self.refresh();
        self.check_io()?;
        Ok(self.params.buffer_frames.saturating_sub(self.queued_frames()))
    }

    fn delay(&mut self) -> Result<i64> {
        self.refresh();
        self.check_io()?;
        Ok(self.queued_frames() as i64)
    }

    fn prepare(&mut self) -> Result<()> {
        if self.state == PcmState::Disconnected {
            return Err(PcmError::Disconnected);
        }
        self.shared.running.store(false, Ordering::Release);
        self.send(StreamControl::Pause)?;
        self.clear();
        self.shared.starved.store(false, Ordering::Release);
        self.state = PcmState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.state != PcmState::Prepared {
            return Err(PcmError::BadState(self.state));
        }
        self.shared.starved.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        self.send(StreamControl::Play)?;
        self.state = PcmState::Running;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Err(PcmError::NotSupported)
    }

    fn pause(&mut self, enable: bool) -> Result<()> {
        match (enable, self.state) {
            (true, PcmState::Running) => {
                self.shared.running.store(false, Ordering::Release);
                self.send(StreamControl::Pause)?;
                self.state = PcmState::Paused;
            }
            (false, PcmState::Paused) => {
                self.shared.running.store(true, Ordering::Release);
                self.send(StreamControl::Play)?;
                self.state = PcmState::Running;
            }
            (_, state) => return Err(PcmError::BadState(state)),
        }
        Ok(())
    }

    fn drop_frames(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        self.send(StreamControl::Pause)?;
        self.clear();
        self.state = PcmState::Setup;
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        if self.state == PcmState::Running {
            let rate = u64::from(self.params.format.sample_rate.max(1));
            let budget = Duration::from_millis(
                self.params.buffer_frames as u64 * 1000 / rate + 100,
            );
            let deadline = Instant::now() + budget;
            while !self.shared.bytes.is_empty() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.drop_frames()
    }

    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let avail = self.avail()?;
            if avail >= self.params.period_frames {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn writei(&mut self, data: &[u8]) -> Result<usize> {
        self.refresh();
        self.check_io()?;
        let align = self.params.format.block_align();
        let frames = (data.len() / align).min(self.avail()?);
        if frames == 0 && data.len() >= align {
            return Err(PcmError::Again);
        }
        for byte in &data[..frames * align] {
            if self.shared.bytes.push(*byte).is_err() {
                break;
            }
        }
        Ok(frames)
    }

    fn readi(&mut self, _data: &mut [u8]) -> Result<usize> {
        Err(PcmError::NotSupported)
    }

    fn mmap_begin(&mut self, _frames: usize) -> Result<(usize, usize)> {
        Err(PcmError::NotSupported)
    }

    fn mmap_area_mut(&mut self, _offset: usize, _frames: usize) -> Result<&mut [u8]> {
        Err(PcmError::NotSupported)
    }

    fn mmap_commit(&mut self, _offset: usize, _frames: usize) -> Result<usize> {
        Err(PcmError::NotSupported)
    }
}

impl Drop for CpalPcm {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.control.send(StreamControl::Shutdown);
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }
}
