//! Render callback used by direct (memory-mapped) streaming sessions.

/// Location of a region handed to a [`DirectRenderer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionInfo {
    /// Offset of the region inside the hardware ring, in frames.
    pub offset_frames: usize,
    /// Length of the region in frames. Always a whole number of periods.
    pub frames: usize,
    /// Monotonic count of bytes committed before this region.
    pub commit_position: u64,
}

/// Fills mapped regions of a direct session's ring with audio.
///
/// Called on the session's streaming thread; implementations must not block.
pub trait DirectRenderer: Send {
    fn render(&mut self, region: &mut [u8], info: RegionInfo);
}

impl<F> DirectRenderer for F
where
    F: FnMut(&mut [u8], RegionInfo) + Send,
{
    fn render(&mut self, region: &mut [u8], info: RegionInfo) {
        self(region, info)
    }
}
