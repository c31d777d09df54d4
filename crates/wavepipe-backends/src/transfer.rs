//! Strategies for moving bytes between a stream buffer and the hardware.

use serde::{Deserialize, Serialize};
use wavepipe_rt::Direction;

use crate::{HwParams, PcmDevice, PcmError, Result};

/// Requested transfer strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMode {
    /// Memory-mapped when the device supports it, read/write otherwise.
    #[default]
    Auto,
    ReadWrite,
    Mmap,
}

/// Moves whole frames between `data` and the device. Returns the number of
/// bytes moved, which may be less than `data.len()`.
pub trait Transfer: Send {
    fn name(&self) -> &'static str;
    fn transfer(&mut self, pcm: &mut dyn PcmDevice, data: &mut [u8]) -> Result<usize>;
}

/// Picks the transfer strategy once, when the stream is opened.
pub fn select_transfer(mode: TransferMode, params: &HwParams) -> Result<Box<dyn Transfer>> {
    match mode {
        TransferMode::ReadWrite => Ok(Box::new(ReadWrite)),
        TransferMode::Mmap if params.mmap => Ok(Box::new(Mapped)),
        TransferMode::Mmap => Err(PcmError::NotSupported),
        TransferMode::Auto if params.mmap => Ok(Box::new(Mapped)),
        TransferMode::Auto => Ok(Box::new(ReadWrite)),
    }
}

/// Plain interleaved read/write calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadWrite;

impl Transfer for ReadWrite {
    fn name(&self) -> &'static str {
        "read-write"
    }

    fn transfer(&mut self, pcm: &mut dyn PcmDevice, data: &mut [u8]) -> Result<usize> {
        let align = pcm.params().format.block_align();
        let frames = match pcm.direction() {
            Direction::Playback => pcm.writei(data)?,
            Direction::Capture => pcm.readi(data)?,
        };
        Ok(frames * align)
    }
}

/// Copies through memory-mapped regions of the hardware ring.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mapped;

impl Transfer for Mapped {
    fn name(&self) -> &'static str {
        "mmap"
    }

    fn transfer(&mut self, pcm: &mut dyn PcmDevice, data: &mut [u8]) -> Result<usize> {
        let format = pcm.params().format;
        let direction = pcm.direction();
        let mut done = 0;
        // At most two regions when the copy wraps around the ring end.
        while done < data.len() {
            let wanted = format.bytes_to_frames(data.len() - done);
            if wanted == 0 {
                break;
            }
            let (offset, frames) = pcm.mmap_begin(wanted)?;
            if frames == 0 {
                break;
            }
            let bytes = format.frames_to_bytes(frames);
            let area = pcm.mmap_area_mut(offset, frames)?;
            match direction {
                Direction::Playback => area.copy_from_slice(&data[done..done + bytes]),
                Direction::Capture => data[done..done + bytes].copy_from_slice(area),
            }
            let committed = pcm.mmap_commit(offset, frames)?;
            done += format.frames_to_bytes(committed);
            if committed < frames {
                break;
            }
        }
        Ok(done)
    }
}
