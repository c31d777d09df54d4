//! Moves queued buffer data to or from the hardware.

use std::time::Duration;

use wavepipe_backends::{PcmDevice, PcmError, PcmState, Transfer};
use wavepipe_rt::{Direction, PositionClock};

use crate::metrics::StreamMetrics;
use crate::queue::BufferQueue;
use crate::recovery::ErrorRecovery;

pub struct BufferFeeder {
    transfer: Box<dyn Transfer>,
    period: Duration,
}

impl BufferFeeder {
    pub fn new(transfer: Box<dyn Transfer>, period: Duration) -> Self {
        Self {
            transfer,
            period: period.max(Duration::from_millis(1)),
        }
    }

    pub fn transfer_name(&self) -> &'static str {
        self.transfer.name()
    }

    /// Transfers as much queued data as the hardware accepts. Returns the
    /// time until the next feed, `None` once no buffer is left to feed, or
    /// the error that made the stream unusable.
    pub(crate) fn feed(
        &mut self,
        pcm: &mut dyn PcmDevice,
        queue: &mut BufferQueue,
        clock: &mut PositionClock,
        recovery: &mut ErrorRecovery,
        metrics: &StreamMetrics,
    ) -> Result<Option<Duration>, PcmError> {
        let direction = pcm.direction();
        let format = pcm.params().format;
        if direction == Direction::Capture && queue.has_play() {
            self.ensure_started(pcm, recovery)?;
        }

        let Some(avail) = self.available(pcm, recovery)? else {
            return Ok(Some(self.period));
        };
        let mut room = format.frames_to_bytes(avail);
        let mut wrote = false;

        while room > 0 {
            let partial = queue.partial();
            let written = clock.transferred();
            if partial == 0 {
                queue.mark_pass(written, clock.confirmed());
            }
            let Some(entry) = queue.play_mut() else {
                break;
            };
            if partial == 0 {
                // The confirmed position at which this pass will have been heard.
                entry.threshold = written + entry.buffer.len() as u64;
                entry.buffer.set_transferred(0);
            }
            let len = entry.buffer.len();
            let chunk = (len - partial).min(room);
            if chunk == 0 {
                queue.advance();
                continue;
            }

            let region = &mut entry.buffer.bytes_mut()[partial..partial + chunk];
            let moved = match self.transfer.transfer(pcm, region) {
                Ok(moved) => moved,
                Err(PcmError::Again) => 0,
                Err(err) => {
                    recovery.recover(pcm, err)?;
                    if direction == Direction::Capture {
                        self.ensure_started(pcm, recovery)?;
                    }
                    match self.transfer.transfer(pcm, region) {
                        Ok(moved) => moved,
                        Err(PcmError::Again) => 0,
                        Err(err) => {
                            tracing::error!(?err, "transfer failed again after recovery");
                            metrics.register_transfer_failure();
                            return Ok(Some(self.period));
                        }
                    }
                }
            };
            if moved == 0 {
                break;
            }

            entry.buffer.set_transferred(partial + moved);
            clock.record_transfer(moved);
            metrics.add_bytes(moved);
            room = room.saturating_sub(moved);
            wrote = true;
            if partial + moved >= len {
                queue.advance();
            } else {
                queue.set_partial(partial + moved);
            }
        }

        if direction == Direction::Playback && wrote && pcm.state() == PcmState::Prepared {
            tracing::debug!("starting playback");
            if let Err(err) = pcm.start() {
                recovery.recover(pcm, err)?;
            }
        }

        Ok(queue.has_play().then_some(self.period))
    }

    fn available(
        &mut self,
        pcm: &mut dyn PcmDevice,
        recovery: &mut ErrorRecovery,
    ) -> Result<Option<usize>, PcmError> {
        match pcm.avail() {
            Ok(avail) => Ok(Some(avail)),
            Err(err) => {
                recovery.recover(pcm, err)?;
                if pcm.direction() == Direction::Capture {
                    self.ensure_started(pcm, recovery)?;
                }
                match pcm.avail() {
                    Ok(avail) => Ok(Some(avail)),
                    Err(err) => {
                        tracing::warn!(?err, "device still unavailable after recovery");
                        Ok(None)
                    }
                }
            }
        }
    }

    fn ensure_started(
        &mut self,
        pcm: &mut dyn PcmDevice,
        recovery: &mut ErrorRecovery,
    ) -> Result<(), PcmError> {
        if pcm.state() == PcmState::Prepared {
            tracing::debug!("starting capture");
            if let Err(err) = pcm.start() {
                recovery.recover(pcm, err)?;
            }
        }
        Ok(())
    }
}
