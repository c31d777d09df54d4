//! Caller-owned audio buffers exchanged with the engine thread.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use wavepipe_rt::PcmFormat;

use crate::error::EngineError;

/// Status and loop flags carried by a [`WaveBuffer`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    /// Returned to the caller after playback or recording.
    pub const DONE: Self = Self(0x01);
    pub const PREPARED: Self = Self(0x02);
    /// First buffer of a repeated region.
    pub const BEGIN_LOOP: Self = Self(0x04);
    /// Last buffer of a repeated region.
    pub const END_LOOP: Self = Self(0x08);
    /// Owned by the engine.
    pub const IN_QUEUE: Self = Self(0x10);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(BufferFlags, &str); 5] = [
            (BufferFlags::DONE, "DONE"),
            (BufferFlags::PREPARED, "PREPARED"),
            (BufferFlags::BEGIN_LOOP, "BEGIN_LOOP"),
            (BufferFlags::END_LOOP, "END_LOOP"),
            (BufferFlags::IN_QUEUE, "IN_QUEUE"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// A block of PCM data submitted for playback or recording.
///
/// The buffer moves into the engine on submission and comes back through
/// [`crate::StreamEvent::BufferCompleted`], so the caller cannot touch it while
/// the engine owns it.
#[derive(Clone, PartialEq, Eq)]
pub struct WaveBuffer {
    data: Vec<u8>,
    bytes_transferred: usize,
    flags: BufferFlags,
    loops: u32,
    user: u64,
}

impl WaveBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            bytes_transferred: 0,
            flags: BufferFlags::NONE,
            loops: 0,
            user: 0,
        }
    }

    /// An empty buffer of `frames` frames for recording.
    pub fn for_capture(format: &PcmFormat, frames: usize) -> Self {
        Self::new(vec![0; format.frames_to_bytes(frames)])
    }

    /// Marks the start and/or end of a region repeated `loops` times.
    pub fn with_loop(mut self, begin: bool, end: bool, loops: u32) -> Self {
        if begin {
            self.flags.insert(BufferFlags::BEGIN_LOOP);
        }
        if end {
            self.flags.insert(BufferFlags::END_LOOP);
        }
        self.loops = loops;
        self
    }

    pub fn with_user(mut self, user: u64) -> Self {
        self.user = user;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes written to the hardware (playback) or recorded into the buffer
    /// (capture) during its last pass.
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    /// Recorded portion of a capture buffer.
    pub fn recorded(&self) -> &[u8] {
        &self.data[..self.bytes_transferred.min(self.data.len())]
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn loops(&self) -> u32 {
        self.loops
    }

    pub fn user(&self) -> u64 {
        self.user
    }

    pub fn is_done(&self) -> bool {
        self.flags.contains(BufferFlags::DONE)
    }

    pub fn is_prepared(&self) -> bool {
        self.flags.contains(BufferFlags::PREPARED)
    }

    pub fn is_queued(&self) -> bool {
        self.flags.contains(BufferFlags::IN_QUEUE)
    }

    pub fn prepare(&mut self) -> Result<(), EngineError> {
        if self.is_queued() {
            return Err(EngineError::StillPlaying);
        }
        self.flags.insert(BufferFlags::PREPARED);
        Ok(())
    }

    pub fn unprepare(&mut self) -> Result<(), EngineError> {
        if self.is_queued() {
            return Err(EngineError::StillPlaying);
        }
        self.flags.remove(BufferFlags::PREPARED);
        Ok(())
    }

    pub(crate) fn mark_queued(&mut self) {
        self.flags.remove(BufferFlags::DONE);
        self.flags.insert(BufferFlags::IN_QUEUE);
        self.bytes_transferred = 0;
    }

    /// Undoes [`WaveBuffer::mark_queued`] for a submission that never
    /// reached the engine.
    pub(crate) fn unmark_queued(&mut self) {
        self.flags.remove(BufferFlags::IN_QUEUE);
    }

    pub(crate) fn mark_done(&mut self) {
        self.flags.remove(BufferFlags::IN_QUEUE);
        self.flags.insert(BufferFlags::DONE);
    }

    pub(crate) fn set_transferred(&mut self, bytes: usize) {
        self.bytes_transferred = bytes;
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for WaveBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveBuffer")
            .field("len", &self.data.len())
            .field("bytes_transferred", &self.bytes_transferred)
            .field("flags", &self.flags)
            .field("loops", &self.loops)
            .field("user", &self.user)
            .finish()
    }
}
