//! Returns finished buffers to the caller.

use std::time::Duration;

use wavepipe_rt::PcmFormat;

use crate::metrics::StreamMetrics;
use crate::queue::BufferQueue;
use crate::sink::{NotificationSink, StreamEvent};

pub struct NotificationWalker {
    bytes_per_second: u64,
}

impl NotificationWalker {
    pub fn new(format: &PcmFormat) -> Self {
        Self {
            bytes_per_second: format.bytes_per_second().max(1),
        }
    }

    /// Completes buffers from the front of the queue. Without `force`, stops
    /// at the first buffer that is still being fed, anchors a running loop, or
    /// has not been heard completely. Returns how long until the next front
    /// buffer is due, or `None` when there is nothing to wait for.
    pub(crate) fn walk(
        &self,
        queue: &mut BufferQueue,
        confirmed: u64,
        force: bool,
        sink: &mut dyn NotificationSink,
        metrics: &StreamMetrics,
    ) -> Option<Duration> {
        loop {
            let due = match queue.front() {
                None => return None,
                Some(entry) => entry.threshold <= confirmed,
            };
            if !force && (queue.front_is_pinned() || !due) {
                break;
            }
            let Some(mut buffer) = queue.pop_front() else {
                return None;
            };
            buffer.mark_done();
            metrics.add_completed();
            tracing::trace!(len = buffer.len(), force, "buffer completed");
            sink.notify(StreamEvent::BufferCompleted {
                buffer,
                forced: force,
            });
        }
        if queue.front_is_pinned() {
            return None;
        }
        queue.front().map(|entry| self.wait_for(entry.threshold, confirmed))
    }

    fn wait_for(&self, threshold: u64, confirmed: u64) -> Duration {
        let millis = threshold.saturating_sub(confirmed).saturating_mul(1000) / self.bytes_per_second;
        Duration::from_millis(millis.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WaveBuffer;
    use wavepipe_rt::Direction;

    fn queue_of(lengths: &[usize]) -> BufferQueue {
        let mut queue = BufferQueue::new(Direction::Playback);
        for (index, len) in lengths.iter().enumerate() {
            queue.push(WaveBuffer::new(vec![0; *len]).with_user(index as u64));
        }
        queue
    }

    /// Feeds every buffer, setting thresholds like the feeder does.
    fn feed_all(queue: &mut BufferQueue) {
        let mut written = 0;
        while let Some(entry) = queue.play_mut() {
            written += entry.buffer.len() as u64;
            entry.threshold = written;
            queue.advance();
        }
    }

    #[test]
    fn completes_heard_buffers_in_order() {
        let walker = NotificationWalker::new(&PcmFormat::cd());
        let metrics = StreamMetrics::new();
        let mut queue = queue_of(&[4096, 4096, 4096]);
        feed_all(&mut queue);
        let mut seen = Vec::new();
        let mut sink = |event: StreamEvent| {
            if let StreamEvent::BufferCompleted { buffer, forced } = event {
                assert!(!forced);
                assert!(buffer.is_done() && !buffer.is_queued());
                seen.push(buffer.user());
            }
        };
        let wait = walker.walk(&mut queue, 8192, false, &mut sink, &metrics);
        // 4096 bytes at 176400 bytes per second.
        assert_eq!(wait, Some(Duration::from_millis(23)));
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(metrics.snapshot().buffers_completed, 2);
    }

    #[test]
    fn stops_at_the_play_pointer() {
        let walker = NotificationWalker::new(&PcmFormat::cd());
        let metrics = StreamMetrics::new();
        let mut queue = queue_of(&[100, 100]);
        let mut count = 0;
        let mut sink = |_: StreamEvent| count += 1;
        assert_eq!(walker.walk(&mut queue, 1_000, false, &mut sink, &metrics), None);
        assert_eq!(count, 0);
    }

    #[test]
    fn force_drains_everything() {
        let walker = NotificationWalker::new(&PcmFormat::cd());
        let metrics = StreamMetrics::new();
        let mut queue = queue_of(&[100, 100, 100]);
        let mut seen = Vec::new();
        let mut sink = |event: StreamEvent| {
            if let StreamEvent::BufferCompleted { buffer, forced } = event {
                assert!(forced);
                seen.push(buffer.user());
            }
        };
        assert_eq!(walker.walk(&mut queue, 0, true, &mut sink, &metrics), None);
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn overdue_buffers_wait_at_least_a_millisecond() {
        let walker = NotificationWalker::new(&PcmFormat::cd());
        assert_eq!(walker.wait_for(10, 20), Duration::from_millis(1));
        assert_eq!(walker.wait_for(20, 19), Duration::from_millis(1));
    }
}
