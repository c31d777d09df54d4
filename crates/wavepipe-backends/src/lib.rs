//! Backends provide access to PCM hardware and mixer controls.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wavepipe_rt::{Direction, PcmFormat};

pub mod sim;
pub mod transfer;

#[cfg(feature = "cpal")]
pub mod cpal_backend;

#[cfg(not(feature = "cpal"))]
pub mod cpal_backend {
    use super::*;

    pub fn open_output(
        _device: Option<&str>,
        _format: PcmFormat,
        _period_frames: usize,
        _periods: usize,
    ) -> Result<Box<dyn PcmDevice>> {
        Err(PcmError::Io(
            "cpal backend not available in this build".into(),
        ))
    }
}

pub use sim::{
    CapturePattern, ManualClock, SimClock, SimConfig, SimProbe, SimStats, SimulatedControl,
    SimulatedPcm,
};
pub use transfer::{select_transfer, Mapped, ReadWrite, Transfer, TransferMode};

pub type Result<T> = std::result::Result<T, PcmError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PcmError {
    #[error("buffer underrun or overrun")]
    Underrun,
    #[error("stream suspended by the system")]
    Suspended,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("operation not supported by this device")]
    NotSupported,
    #[error("operation invalid in pcm state {0:?}")]
    BadState(PcmState),
    #[error("device disconnected")]
    Disconnected,
    #[error("backend error: {0}")]
    Io(String),
}

/// Hardware PCM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PcmState {
    Setup,
    Prepared,
    Running,
    Xrun,
    Draining,
    Paused,
    Suspended,
    Disconnected,
}

/// Parameters negotiated when the PCM was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwParams {
    pub format: PcmFormat,
    pub period_frames: usize,
    pub buffer_frames: usize,
    pub can_pause: bool,
    pub can_resume: bool,
    pub mmap: bool,
}

impl HwParams {
    pub fn period_bytes(&self) -> usize {
        self.format.frames_to_bytes(self.period_frames)
    }

    pub fn buffer_bytes(&self) -> usize {
        self.format.frames_to_bytes(self.buffer_frames)
    }

    /// Wall-clock length of one period.
    pub fn period_time(&self) -> Duration {
        let rate = u64::from(self.format.sample_rate.max(1));
        Duration::from_micros(self.period_frames as u64 * 1_000_000 / rate)
    }
}

/// An opened hardware PCM stream. All frame counts are in frames of the
/// negotiated format.
pub trait PcmDevice: Send {
    fn params(&self) -> &HwParams;
    fn direction(&self) -> Direction;
    /// Identifier of the underlying hardware, shared by every handle that
    /// opens the same device.
    fn hardware_id(&self) -> &str;

    fn state(&mut self) -> PcmState;
    /// Frames that can be written (playback) or read (capture) right now.
    fn avail(&mut self) -> Result<usize>;
    /// Frames between the application pointer and the hardware pointer.
    /// Some drivers report negative values after an xrun.
    fn delay(&mut self) -> Result<i64>;

    fn prepare(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn pause(&mut self, enable: bool) -> Result<()>;
    /// Stops immediately, discarding pending frames.
    fn drop_frames(&mut self) -> Result<()>;
    /// Stops after pending frames have been played.
    fn drain(&mut self) -> Result<()>;
    /// Blocks until at least one period can be transferred or the timeout
    /// elapses. Returns whether the device became ready.
    fn wait(&mut self, timeout: Duration) -> Result<bool>;

    /// Writes whole frames from `data` without blocking; returns frames written.
    fn writei(&mut self, data: &[u8]) -> Result<usize>;
    /// Reads whole frames into `data` without blocking; returns frames read.
    fn readi(&mut self, data: &mut [u8]) -> Result<usize>;

    /// Maps up to `frames` contiguous frames of the hardware ring. Returns the
    /// ring offset and the number of frames actually mapped.
    fn mmap_begin(&mut self, frames: usize) -> Result<(usize, usize)>;
    fn mmap_area_mut(&mut self, offset: usize, frames: usize) -> Result<&mut [u8]>;
    fn mmap_commit(&mut self, offset: usize, frames: usize) -> Result<usize>;
}

impl<P: PcmDevice + ?Sized> PcmDevice for Box<P> {
    fn params(&self) -> &HwParams {
        (**self).params()
    }
    fn direction(&self) -> Direction {
        (**self).direction()
    }
    fn hardware_id(&self) -> &str {
        (**self).hardware_id()
    }
    fn state(&mut self) -> PcmState {
        (**self).state()
    }
    fn avail(&mut self) -> Result<usize> {
        (**self).avail()
    }
    fn delay(&mut self) -> Result<i64> {
        (**self).delay()
    }
    fn prepare(&mut self) -> Result<()> {
        (**self).prepare()
    }
    fn start(&mut self) -> Result<()> {
        (**self).start()
    }
    fn resume(&mut self) -> Result<()> {
        (**self).resume()
    }
    fn pause(&mut self, enable: bool) -> Result<()> {
        (**self).pause(enable)
    }
    fn drop_frames(&mut self) -> Result<()> {
        (**self).drop_frames()
    }
    fn drain(&mut self) -> Result<()> {
        (**self).drain()
    }
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        (**self).wait(timeout)
    }
    fn writei(&mut self, data: &[u8]) -> Result<usize> {
        (**self).writei(data)
    }
    fn readi(&mut self, data: &mut [u8]) -> Result<usize> {
        (**self).readi(data)
    }
    fn mmap_begin(&mut self, frames: usize) -> Result<(usize, usize)> {
        (**self).mmap_begin(frames)
    }
    fn mmap_area_mut(&mut self, offset: usize, frames: usize) -> Result<&mut [u8]> {
        (**self).mmap_area_mut(offset, frames)
    }
    fn mmap_commit(&mut self, offset: usize, frames: usize) -> Result<usize> {
        (**self).mmap_commit(offset, frames)
    }
}

/// Range and slot count of an integer mixer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub min: i64,
    pub max: i64,
    pub step: i64,
    /// Number of values (channels) the element carries.
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("control element not found: {0}")]
    ElementNotFound(String),
    #[error("control error: {0}")]
    Io(String),
}

/// Handle to a card's control interface.
pub trait ControlDevice: Send {
    fn element_info(&self, name: &str) -> std::result::Result<ElementInfo, ControlError>;
    fn read_integers(&self, name: &str) -> std::result::Result<Vec<i64>, ControlError>;
    fn write_integers(
        &mut self,
        name: &str,
        values: &[i64],
    ) -> std::result::Result<(), ControlError>;
}
