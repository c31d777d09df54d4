use crate::transport::Direction;

/// Tracks how many bytes have crossed the hardware boundary and how many of
/// those the listener has actually heard (or the capture side has delivered).
///
/// The confirmed position never decreases between resets.
#[derive(Debug, Clone)]
pub struct PositionClock {
    direction: Direction,
    block_align: u64,
    transferred: u64,
    confirmed: u64,
}

impl PositionClock {
    pub fn new(direction: Direction, block_align: usize) -> Self {
        Self {
            direction,
            block_align: block_align.max(1) as u64,
            transferred: 0,
            confirmed: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes written to (or read from) the hardware so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Bytes the hardware has consumed (playback) or produced (capture).
    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    /// Bytes handed to the hardware but not yet played.
    pub fn in_flight(&self) -> u64 {
        self.transferred - self.confirmed
    }

    pub fn record_transfer(&mut self, bytes: usize) {
        self.transferred += bytes as u64;
        if self.direction == Direction::Capture {
            self.confirmed = self.transferred;
        }
    }

    /// Derives the confirmed position from the hardware delay in frames.
    /// A negative delay (reported by some drivers after an xrun) counts as
    /// zero.
    pub fn update_from_delay(&mut self, delay_frames: i64) -> u64 {
        match self.direction {
            Direction::Playback => {
                let delay = (delay_frames.max(0) as u64).saturating_mul(self.block_align);
                let heard = self.transferred.saturating_sub(delay);
                self.confirmed = self.confirmed.max(heard).min(self.transferred);
            }
            Direction::Capture => self.confirmed = self.transferred,
        }
        self.confirmed
    }

    /// Everything transferred so far has been heard, e.g. after a drain.
    pub fn mark_all_confirmed(&mut self) {
        self.confirmed = self.transferred;
    }

    /// Forgets bytes that were written but never played. Used when the
    /// hardware drops its buffer and the data will be written again.
    pub fn rewind_to_confirmed(&mut self) -> u64 {
        let lost = self.in_flight();
        self.transferred = self.confirmed;
        lost
    }

    pub fn reset(&mut self) {
        self.transferred = 0;
        self.confirmed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_position_follows_delay() {
        let mut clock = PositionClock::new(Direction::Playback, 4);
        clock.record_transfer(4096);
        assert_eq!(clock.update_from_delay(1024), 0);
        assert_eq!(clock.update_from_delay(512), 2048);
        assert_eq!(clock.update_from_delay(0), 4096);
    }

    #[test]
    fn position_never_moves_backwards() {
        let mut clock = PositionClock::new(Direction::Playback, 4);
        clock.record_transfer(4096);
        clock.update_from_delay(256);
        assert_eq!(clock.confirmed(), 3072);
        // A larger delay after recovery must not pull the position back.
        assert_eq!(clock.update_from_delay(900), 3072);
        assert_eq!(clock.update_from_delay(-5), 4096);
    }

    #[test]
    fn capture_confirms_what_was_read() {
        let mut clock = PositionClock::new(Direction::Capture, 2);
        clock.record_transfer(100);
        assert_eq!(clock.confirmed(), 100);
        assert_eq!(clock.update_from_delay(40), 100);
    }

    #[test]
    fn rewind_drops_unplayed_bytes() {
        let mut clock = PositionClock::new(Direction::Playback, 4);
        clock.record_transfer(1000);
        clock.update_from_delay(100);
        assert_eq!(clock.rewind_to_confirmed(), 400);
        assert_eq!(clock.transferred(), 600);
        clock.reset();
        assert_eq!((clock.transferred(), clock.confirmed()), (0, 0));
    }
}
