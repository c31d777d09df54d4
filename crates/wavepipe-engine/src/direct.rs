//! Low-latency streaming straight into the memory-mapped hardware ring.
//!
//! A direct session has no buffer queue. The caller owns a mirror of the
//! hardware ring (written with [`DirectStreamSession::write_at`] or filled by a
//! [`DirectRenderer`] on the streaming thread), and the streaming thread copies
//! every free period of the mirror into the hardware as soon as the device can
//! take it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use wavepipe_backends::{HwParams, PcmDevice, PcmError, PcmState};
use wavepipe_rt::{Direction, DirectRenderer, RegionInfo};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metrics::{MetricsSnapshot, StreamMetrics};
use crate::recovery::{ErrorRecovery, SuspendPolicy};
use crate::rt::promote_current_thread;

#[derive(Debug, Default)]
struct DirectShared {
    running: AtomicBool,
    /// Bytes committed to the hardware since the last start.
    committed: AtomicU64,
    /// Frames the hardware has played since the last start.
    played_frames: AtomicU64,
}

impl DirectShared {
    fn reset(&self) {
        self.committed.store(0, Ordering::Release);
        self.played_frames.store(0, Ordering::Release);
    }
}

struct Streaming {
    pcm: Box<dyn PcmDevice>,
    renderer: Option<Box<dyn DirectRenderer>>,
}

struct Worker {
    handle: JoinHandle<(Streaming, Option<PcmError>)>,
}

pub struct DirectStreamSession {
    /// `None` while the streaming thread owns the device.
    idle: Option<Streaming>,
    worker: Option<Worker>,
    params: HwParams,
    hardware_id: String,
    mirror: Arc<Mutex<Vec<u8>>>,
    shared: Arc<DirectShared>,
    metrics: Arc<StreamMetrics>,
    policy: SuspendPolicy,
    priority: Option<i32>,
}

impl DirectStreamSession {
    pub fn open(
        pcm: Box<dyn PcmDevice>,
        renderer: Option<Box<dyn DirectRenderer>>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        if pcm.direction() != Direction::Playback {
            return Err(EngineError::InvalidParam("direct sessions are playback only"));
        }
        let params = pcm.params().clone();
        if !params.mmap {
            return Err(EngineError::MmapUnsupported);
        }
        params.format.validate()?;
        let silence = params.format.encoding.silence_byte();
        let hardware_id = pcm.hardware_id().to_string();
        tracing::info!(
            device = %hardware_id,
            periods = params.buffer_frames / params.period_frames.max(1),
            period_frames = params.period_frames,
            "direct session opened"
        );
        Ok(Self {
            mirror: Arc::new(Mutex::new(vec![silence; params.buffer_bytes()])),
            idle: Some(Streaming { pcm, renderer }),
            worker: None,
            params,
            hardware_id,
            shared: Arc::new(DirectShared::default()),
            metrics: Arc::new(StreamMetrics::new()),
            policy: config.suspend_policy(),
            priority: config.realtime_priority,
        })
    }

    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    pub fn params(&self) -> &HwParams {
        &self.params
    }

    /// Size of the hardware ring and of the mirror, in bytes.
    pub fn buffer_len(&self) -> usize {
        self.params.buffer_bytes()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.shared.running.load(Ordering::Acquire)
    }

    /// Bytes committed to the hardware since the last start.
    pub fn commit_position(&self) -> u64 {
        self.shared.committed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Play and write cursors as byte offsets into the ring, rounded to
    /// periods. The write cursor is one period ahead of the play cursor.
    pub fn position(&self) -> (usize, usize) {
        let format = self.params.format;
        let period = self.params.period_frames.max(1) as u64;
        let ring = self.params.buffer_bytes().max(1);
        let played = self.shared.played_frames.load(Ordering::Acquire);
        let play = format.frames_to_bytes((played / period * period) as usize) % ring;
        let write = format.frames_to_bytes(((played / period + 1) * period) as usize) % ring;
        (play, write)
    }

    /// Copies `data` into the mirror at `offset`, wrapping at the ring end.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), EngineError> {
        let mut mirror = self.mirror.lock();
        let len = mirror.len();
        if data.len() > len {
            return Err(EngineError::InvalidParam("write larger than the ring"));
        }
        let start = offset % len;
        let first = data.len().min(len - start);
        mirror[start..start + first].copy_from_slice(&data[..first]);
        mirror[..data.len() - first].copy_from_slice(&data[first..]);
        Ok(())
    }

    /// Resets the commit position, fills the hardware from the mirror and
    /// starts streaming.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let mut streaming = self.idle.take().ok_or(EngineError::NotOpen)?;
        if let Err(err) = self.prime(&mut streaming) {
            self.idle = Some(streaming);
            return Err(err.into());
        }

        self.shared.running.store(true, Ordering::Release);
        let mirror = Arc::clone(&self.mirror);
        let shared = Arc::clone(&self.shared);
        let metrics = Arc::clone(&self.metrics);
        let policy = self.policy;
        let priority = self.priority;
        let spawned = thread::Builder::new()
            .name("wavepipe-direct".into())
            .spawn(move || {
                if let Some(priority) = priority {
                    promote_current_thread(priority);
                }
                stream(streaming, &mirror, &shared, metrics, policy)
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker { handle });
                tracing::debug!(device = %self.hardware_id, "direct session started");
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(EngineError::Thread(err.to_string()))
            }
        }
    }

    fn prime(&self, streaming: &mut Streaming) -> Result<(), PcmError> {
        let pcm = streaming.pcm.as_mut();
        if matches!(pcm.state(), PcmState::Setup | PcmState::Xrun) {
            pcm.prepare()?;
        }
        self.shared.reset();
        copy_periods(
            pcm,
            &mut streaming.renderer,
            &self.mirror,
            &self.shared,
            &self.metrics,
        )?;
        pcm.start()
    }

    /// Stops streaming and lets the hardware play out what was committed.
    /// Returns the error that ended streaming early, if any.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.shared.running.store(false, Ordering::Release);
        let (mut streaming, fault) = match worker.handle.join() {
            Ok(exit) => exit,
            Err(_) => {
                tracing::error!(device = %self.hardware_id, "direct streaming thread panicked");
                return Err(EngineError::DeviceGone);
            }
        };
        let drained = streaming.pcm.drain();
        self.idle = Some(streaming);
        tracing::debug!(device = %self.hardware_id, "direct session stopped");
        if let Some(err) = fault {
            return Err(EngineError::Hardware(err));
        }
        match drained {
            Err(PcmError::Disconnected) => Err(EngineError::DeviceGone),
            Err(err) => {
                tracing::debug!(?err, "drain after direct streaming");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

impl Drop for DirectStreamSession {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "direct session ended with an error");
        }
    }
}

/// Copies whole free periods from the mirror into the hardware ring, giving
/// the renderer a chance to fill each region first.
fn copy_periods(
    pcm: &mut dyn PcmDevice,
    renderer: &mut Option<Box<dyn DirectRenderer>>,
    mirror: &Mutex<Vec<u8>>,
    shared: &DirectShared,
    metrics: &StreamMetrics,
) -> Result<(), PcmError> {
    let format = pcm.params().format;
    let period = pcm.params().period_frames.max(1);
    loop {
        let avail = pcm.avail()?;
        if avail < period {
            return Ok(());
        }
        let (offset, frames) = pcm.mmap_begin(avail / period * period)?;
        if frames == 0 {
            return Ok(());
        }
        let start = format.frames_to_bytes(offset);
        let len = format.frames_to_bytes(frames);
        {
            let mut mirror = mirror.lock();
            let region = &mut mirror[start..start + len];
            if let Some(renderer) = renderer.as_mut() {
                let info = RegionInfo {
                    offset_frames: offset,
                    frames,
                    commit_position: shared.committed.load(Ordering::Acquire),
                };
                renderer.render(region, info);
            }
            pcm.mmap_area_mut(offset, frames)?.copy_from_slice(region);
        }
        let committed = pcm.mmap_commit(offset, frames)?;
        let bytes = format.frames_to_bytes(committed);
        shared.committed.fetch_add(bytes as u64, Ordering::AcqRel);
        metrics.add_bytes(bytes);
        if committed < frames {
            return Ok(());
        }
    }
}

fn publish_played(pcm: &mut dyn PcmDevice, shared: &DirectShared) {
    let Ok(delay) = pcm.delay() else {
        return;
    };
    let align = pcm.params().format.block_align().max(1) as u64;
    let committed = shared.committed.load(Ordering::Acquire) / align;
    let played = committed.saturating_sub(delay.max(0) as u64);
    shared.played_frames.fetch_max(played, Ordering::AcqRel);
}

fn stream(
    mut streaming: Streaming,
    mirror: &Mutex<Vec<u8>>,
    shared: &DirectShared,
    metrics: Arc<StreamMetrics>,
    policy: SuspendPolicy,
) -> (Streaming, Option<PcmError>) {
    let mut recovery = ErrorRecovery::new(policy, Arc::clone(&metrics));
    let timeout = (streaming.pcm.params().period_time() * 2).max(Duration::from_millis(1));
    let mut fault = None;

    while shared.running.load(Ordering::Acquire) {
        if let Err(err) = pass(&mut streaming, &mut recovery, mirror, shared, &metrics, timeout) {
            tracing::error!(?err, "direct streaming stopped");
            fault = Some(err);
            shared.running.store(false, Ordering::Release);
            break;
        }
    }
    (streaming, fault)
}

fn pass(
    streaming: &mut Streaming,
    recovery: &mut ErrorRecovery,
    mirror: &Mutex<Vec<u8>>,
    shared: &DirectShared,
    metrics: &StreamMetrics,
    timeout: Duration,
) -> Result<(), PcmError> {
    let pcm = streaming.pcm.as_mut();
    if let Err(err) = pcm.wait(timeout) {
        recovery.recover(pcm, err)?;
    }
    recovery.check_state(pcm)?;
    if let Err(err) = copy_periods(pcm, &mut streaming.renderer, mirror, shared, metrics) {
        recovery.recover(pcm, err)?;
    }
    if pcm.state() == PcmState::Prepared {
        if let Err(err) = pcm.start() {
            recovery.recover(pcm, err)?;
        }
    }
    publish_played(pcm, shared);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavepipe_backends::{SimClock, SimConfig, SimulatedPcm};
    use wavepipe_rt::PcmFormat;

    fn session(mmap: bool) -> Result<DirectStreamSession, EngineError> {
        let pcm = SimulatedPcm::playback(
            PcmFormat::cd(),
            SimConfig {
                period_frames: 64,
                periods: 4,
                mmap,
                clock: SimClock::Manual(Default::default()),
                ..SimConfig::default()
            },
        );
        DirectStreamSession::open(Box::new(pcm), None, &EngineConfig::default())
    }

    #[test]
    fn requires_mmap() {
        assert!(matches!(session(false), Err(EngineError::MmapUnsupported)));
    }

    #[test]
    fn write_at_wraps_around_the_ring() {
        let session = session(true).unwrap();
        let len = session.buffer_len();
        session.write_at(len - 2, &[1, 2, 3, 4]).unwrap();
        let mirror = session.mirror.lock();
        assert_eq!(&mirror[len - 2..], &[1, 2]);
        assert_eq!(&mirror[..2], &[3, 4]);
        assert_eq!(mirror[2], 0);
    }

    #[test]
    fn oversized_writes_are_rejected() {
        let session = session(true).unwrap();
        let data = vec![0; session.buffer_len() + 1];
        assert!(matches!(session.write_at(0, &data), Err(EngineError::InvalidParam(_))));
    }

    #[test]
    fn cursors_are_period_aligned() {
        let session = session(true).unwrap();
        assert_eq!(session.position(), (0, 256));
        session.shared.played_frames.store(100, Ordering::Release);
        assert_eq!(session.position(), (256, 512));
        session.shared.played_frames.store(255, Ordering::Release);
        // The write cursor wraps at the end of the 1024 byte ring.
        assert_eq!(session.position(), (768, 0));
    }
}
