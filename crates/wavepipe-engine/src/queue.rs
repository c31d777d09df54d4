//! The engine-side buffer queue: submission order, play pointer, loop anchor.
//!
//! Entries are addressed by sequence numbers that keep increasing while the
//! queue is reaped from the front, so the play pointer and loop anchor stay
//! valid without back-links between buffers.
//!
//! Every pass the feeder starts over a buffer leaves a [`PassMark`]. When the
//! hardware throws away data it had not played yet, the marks tell where the
//! first unheard byte came from, including which loop pass it belonged to.

use std::collections::VecDeque;

use wavepipe_rt::Direction;

use crate::buffer::{BufferFlags, WaveBuffer};

/// Threshold of an entry that has not been fed yet.
const UNFED: u64 = u64::MAX;

#[derive(Debug)]
pub(crate) struct QueuedBuffer {
    pub buffer: WaveBuffer,
    /// Confirmed position at which the buffer has been fully heard.
    pub threshold: u64,
}

/// Queue state at the moment the feeder started a pass over one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PassMark {
    seq: u64,
    /// Transferred position of the first byte of the pass.
    start: u64,
    anchor: Option<u64>,
    loops_left: u32,
}

#[derive(Debug)]
pub(crate) struct BufferQueue {
    direction: Direction,
    entries: VecDeque<QueuedBuffer>,
    base: u64,
    play: Option<u64>,
    anchor: Option<u64>,
    loops_left: u32,
    partial: usize,
    marks: VecDeque<PassMark>,
}

impl BufferQueue {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            entries: VecDeque::new(),
            base: 0,
            play: None,
            anchor: None,
            loops_left: 0,
            partial: 0,
            marks: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_play(&self) -> bool {
        self.play.is_some()
    }

    pub fn partial(&self) -> usize {
        self.partial
    }

    pub fn set_partial(&mut self, partial: usize) {
        self.partial = partial;
    }

    fn end(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    fn entry(&self, seq: u64) -> Option<&QueuedBuffer> {
        let index = seq.checked_sub(self.base)?;
        self.entries.get(index as usize)
    }

    /// Appends a buffer; it becomes the play pointer if nothing is playing.
    pub fn push(&mut self, buffer: WaveBuffer) {
        let seq = self.end();
        self.entries.push_back(QueuedBuffer {
            buffer,
            threshold: UNFED,
        });
        if self.play.is_none() {
            self.begin(Some(seq));
        }
    }

    /// Makes `seq` the play pointer, opening a loop if it starts one.
    fn begin(&mut self, seq: Option<u64>) {
        self.play = seq;
        self.partial = 0;
        let Some(seq) = seq else {
            return;
        };
        if self.direction == Direction::Capture {
            return;
        }
        let Some(entry) = self.entry(seq) else {
            return;
        };
        if entry.buffer.flags().contains(BufferFlags::BEGIN_LOOP) {
            if self.anchor.is_some() {
                tracing::warn!(seq, "already in a loop, discarding loop on this buffer");
            } else {
                self.loops_left = entry.buffer.loops();
                self.anchor = Some(seq);
            }
        }
    }

    fn next_of(&self, seq: u64) -> Option<u64> {
        let next = seq + 1;
        (next < self.end()).then_some(next)
    }

    /// Moves the play pointer past a fully transferred buffer.
    pub fn advance(&mut self) {
        let Some(current) = self.play else {
            return;
        };
        self.partial = 0;
        let ends_loop = self
            .entry(current)
            .is_some_and(|entry| entry.buffer.flags().contains(BufferFlags::END_LOOP));
        let Some(anchor) = self.anchor.filter(|_| ends_loop) else {
            self.begin(self.next_of(current));
            return;
        };
        self.loops_left = self.loops_left.saturating_sub(1);
        if self.loops_left > 0 {
            self.play = Some(anchor);
            return;
        }
        let restarts = current != anchor
            && self
                .entry(current)
                .is_some_and(|entry| entry.buffer.flags().contains(BufferFlags::BEGIN_LOOP));
        self.anchor = None;
        // A buffer that closes one loop and opens another plays again as the
        // first buffer of the new loop.
        let next = if restarts {
            Some(current)
        } else {
            self.next_of(current)
        };
        self.begin(next);
    }

    /// Records that the pass over the play pointer starts at transferred
    /// position `start`. Marks wholly before `confirmed` are forgotten.
    pub fn mark_pass(&mut self, start: u64, confirmed: u64) {
        let Some(seq) = self.play else {
            return;
        };
        if self.direction == Direction::Capture {
            return;
        }
        let mark = PassMark {
            seq,
            start,
            anchor: self.anchor,
            loops_left: self.loops_left,
        };
        // A pass that wrote nothing the first time is marked again on retry.
        if self.marks.back() != Some(&mark) {
            self.marks.push_back(mark);
        }
        while self.marks.len() > 1 && self.marks[1].start <= confirmed {
            self.marks.pop_front();
        }
    }

    /// Forces the active loop to end after its current pass.
    pub fn break_loop(&mut self) -> bool {
        let Some(anchor) = self.anchor else {
            return false;
        };
        self.loops_left = 1;
        // Passes written ahead of the listener are replayed under the break too.
        for mark in self.marks.iter_mut().filter(|mark| mark.anchor == Some(anchor)) {
            mark.loops_left = 1;
        }
        true
    }

    /// The buffer currently being fed.
    pub fn play_mut(&mut self) -> Option<&mut QueuedBuffer> {
        let index = self.play?.checked_sub(self.base)?;
        self.entries.get_mut(index as usize)
    }

    pub fn front(&self) -> Option<&QueuedBuffer> {
        self.entries.front()
    }

    /// Whether the front entry is the play pointer or the loop anchor, which
    /// must stay queued.
    pub fn front_is_pinned(&self) -> bool {
        self.play == Some(self.base) || self.anchor == Some(self.base)
    }

    pub fn pop_front(&mut self) -> Option<WaveBuffer> {
        let entry = self.entries.pop_front()?;
        let seq = self.base;
        self.base += 1;
        if self.play == Some(seq) {
            self.play = None;
            self.partial = 0;
        }
        if self.anchor == Some(seq) {
            self.anchor = None;
        }
        Some(entry.buffer)
    }

    /// Moves the play pointer back to the first of the `written` bytes that
    /// was not `played`, for restarting after the hardware dropped its buffer.
    /// Loop anchor and loop count are restored to what they were when that
    /// byte was fed. Returns the new written total.
    pub fn rewind(&mut self, written: u64, played: u64) -> u64 {
        if played >= written {
            return written;
        }
        let Some(index) = self.marks.iter().rposition(|mark| mark.start <= played) else {
            tracing::error!(written, played, "no record of the unplayed data");
            return played;
        };
        self.marks.truncate(index + 1);
        let mark = self.marks[index];
        let Some(len) = self.entry(mark.seq).map(|entry| entry.buffer.len()) else {
            tracing::error!(seq = mark.seq, "unplayed data belongs to a reaped buffer");
            self.marks.clear();
            return played;
        };

        self.anchor = mark.anchor;
        self.loops_left = mark.loops_left;
        self.play = Some(mark.seq);
        let heard = (played - mark.start) as usize;
        if heard >= len {
            self.partial = 0;
            self.advance();
        } else {
            self.partial = heard;
        }
        let offset = self.partial;
        let resumed = self.play == Some(mark.seq);
        if let Some(entry) = self.play_mut().filter(|_| resumed) {
            // A loop may have fed this buffer again since; the replayed pass
            // is the one that counts now.
            entry.threshold = mark.start + len as u64;
            entry.buffer.set_transferred(offset);
        }
        // Later buffers are fed again and get fresh thresholds then.
        if let Some(play) = self.play {
            let first_later = (play + 1).saturating_sub(self.base) as usize;
            for entry in self.entries.iter_mut().skip(first_later) {
                entry.threshold = UNFED;
            }
        }
        tracing::debug!(
            seq = mark.seq,
            offset,
            loops_left = self.loops_left,
            "replaying from the first unheard byte"
        );
        played
    }

    /// Removes every entry and clears the play pointer and loop state.
    pub fn clear(&mut self) -> Vec<WaveBuffer> {
        self.base = self.end();
        self.play = None;
        self.anchor = None;
        self.loops_left = 0;
        self.partial = 0;
        self.marks.clear();
        self.entries.drain(..).map(|entry| entry.buffer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn buffer(user: u64) -> WaveBuffer {
        WaveBuffer::new(vec![0; 4]).with_user(user)
    }

    /// Plays the queue to exhaustion and records the order buffers are fed.
    fn play_order(queue: &mut BufferQueue) -> Vec<u64> {
        let mut order = Vec::new();
        while let Some(entry) = queue.play_mut() {
            order.push(entry.buffer.user());
            queue.advance();
            assert!(order.len() < 1000, "runaway loop");
        }
        order
    }

    #[test]
    fn loop_repeats_the_region() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(buffer(1));
        queue.push(buffer(2).with_loop(true, false, 3));
        queue.push(buffer(3));
        queue.push(buffer(4).with_loop(false, true, 0));
        queue.push(buffer(5));
        assert_eq!(play_order(&mut queue), vec![1, 2, 3, 4, 2, 3, 4, 2, 3, 4, 5]);
    }

    #[test]
    fn single_buffer_loop() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(buffer(1).with_loop(true, true, 2));
        queue.push(buffer(2));
        assert_eq!(play_order(&mut queue), vec![1, 1, 2]);
    }

    #[test]
    fn nested_loop_start_is_discarded() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(buffer(1).with_loop(true, false, 2));
        queue.push(buffer(2).with_loop(true, false, 5));
        queue.push(buffer(3).with_loop(false, true, 0));
        assert_eq!(play_order(&mut queue), vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn overlapping_loop_starts_on_the_closing_buffer() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(buffer(1).with_loop(true, false, 2));
        queue.push(buffer(2).with_loop(true, true, 2));
        queue.push(buffer(3).with_loop(false, true, 0));
        // 1 2 1 2 closes the first loop; 2 then opens and closes a loop of
        // its own and plays twice more before moving on.
        assert_eq!(play_order(&mut queue), vec![1, 2, 1, 2, 2, 2, 3]);
    }

    #[test]
    fn capture_ignores_loop_markers() {
        let mut queue = BufferQueue::new(Direction::Capture);
        queue.push(buffer(1).with_loop(true, true, 4));
        queue.push(buffer(2));
        assert_eq!(play_order(&mut queue), vec![1, 2]);
    }

    #[test]
    fn break_loop_exits_after_the_current_pass() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(buffer(1).with_loop(true, false, 100));
        queue.push(buffer(2).with_loop(false, true, 0));
        queue.push(buffer(3));
        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(queue.play_mut().unwrap().buffer.user());
            queue.advance();
        }
        assert!(queue.break_loop());
        order.extend(play_order(&mut queue));
        assert_eq!(order, vec![1, 2, 1, 2, 1, 2, 3]);
    }

    #[test]
    fn front_is_pinned_by_play_and_anchor() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(buffer(1).with_loop(true, false, 2));
        queue.push(buffer(2).with_loop(false, true, 0));
        assert!(queue.front_is_pinned());
        queue.advance();
        // The anchor still holds the front while the play pointer moved on.
        assert!(queue.front_is_pinned());
    }

    fn sized(len: usize, user: u64) -> WaveBuffer {
        WaveBuffer::new(vec![0; len]).with_user(user)
    }

    /// Feeds `bytes` bytes the way the feeder does: marks each pass and sets
    /// its threshold. Returns the new written total.
    fn feed(queue: &mut BufferQueue, mut written: u64, mut bytes: usize) -> u64 {
        while bytes > 0 {
            let partial = queue.partial();
            if partial == 0 {
                queue.mark_pass(written, 0);
            }
            let Some(entry) = queue.play_mut() else {
                break;
            };
            let len = entry.buffer.len();
            if partial == 0 {
                entry.threshold = written + len as u64;
            }
            let chunk = (len - partial).min(bytes);
            written += chunk as u64;
            bytes -= chunk;
            if partial + chunk >= len {
                queue.advance();
            } else {
                queue.set_partial(partial + chunk);
            }
        }
        written
    }

    #[test]
    fn rewind_restarts_at_the_unplayed_offset() {
        let mut queue = BufferQueue::new(Direction::Playback);
        for user in 0..3 {
            queue.push(sized(100, user));
        }
        let written = feed(&mut queue, 0, 150);
        assert_eq!(queue.rewind(written, 30), 30);
        assert_eq!(queue.partial(), 30);
        assert_eq!(queue.play_mut().map(|entry| entry.buffer.user()), Some(0));
        assert!(queue.front_is_pinned());
        assert_eq!(queue.entry(1).map(|entry| entry.threshold), Some(UNFED));
    }

    #[test]
    fn rewind_skips_fully_heard_buffers() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(sized(100, 0));
        queue.push(sized(100, 1));
        let written = feed(&mut queue, 0, 200);
        assert!(!queue.has_play());

        // Front not reaped yet.
        queue.rewind(written, 120);
        assert_eq!(queue.partial(), 20);
        assert_eq!(queue.play_mut().map(|entry| entry.buffer.user()), Some(1));
        assert!(!queue.front_is_pinned());
        assert_eq!(queue.front().map(|entry| entry.threshold), Some(100));
    }

    #[test]
    fn rewind_before_a_loop_replays_every_pass() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(sized(100, 9));
        queue.push(sized(100, 1).with_loop(true, false, 2));
        queue.push(sized(100, 2).with_loop(false, true, 0));
        queue.push(sized(100, 3));
        // X, A, B and the second pass of A are written, half of X is heard.
        let written = feed(&mut queue, 0, 400);
        queue.rewind(written, 50);

        assert_eq!(queue.partial(), 50);
        assert!(queue.front_is_pinned());
        assert_eq!(play_order(&mut queue), vec![9, 1, 2, 1, 2, 3]);
    }

    #[test]
    fn rewind_inside_a_loop_keeps_the_pass_count() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(sized(100, 1).with_loop(true, false, 3));
        queue.push(sized(100, 2).with_loop(false, true, 0));
        queue.push(sized(100, 3));
        // Up to the middle of the third pass of A, heard into the first B.
        let written = feed(&mut queue, 0, 450);
        queue.rewind(written, 130);

        assert_eq!(queue.partial(), 30);
        assert_eq!(queue.play_mut().map(|entry| entry.threshold), Some(200));
        // B of pass one, then two more full passes.
        assert_eq!(play_order(&mut queue), vec![2, 1, 2, 1, 2, 3]);
    }

    #[test]
    fn rewind_after_a_break_still_ends_the_loop() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(sized(100, 1).with_loop(true, true, 50));
        queue.push(sized(100, 2));
        let written = feed(&mut queue, 0, 300);
        assert!(queue.break_loop());
        queue.rewind(written, 40);

        assert_eq!(queue.partial(), 40);
        assert_eq!(play_order(&mut queue), vec![1, 2]);
    }

    #[test]
    fn marks_behind_the_listener_are_forgotten() {
        let mut queue = BufferQueue::new(Direction::Playback);
        for user in 0..4 {
            queue.push(sized(100, user));
        }
        let mut written = 0;
        for _ in 0..4 {
            queue.mark_pass(written, written);
            written += 100;
            queue.advance();
        }
        assert_eq!(queue.marks.len(), 1);
        assert_eq!(queue.marks[0].start, 300);
    }

    #[test]
    fn nothing_to_replay_when_everything_was_heard() {
        let mut queue = BufferQueue::new(Direction::Playback);
        queue.push(sized(100, 0));
        let written = feed(&mut queue, 0, 100);
        assert_eq!(queue.rewind(written, written), 100);
        assert!(!queue.has_play());
    }

    proptest! {
        #[test]
        fn plain_queues_play_in_submission_order(count in 0usize..64) {
            let mut queue = BufferQueue::new(Direction::Playback);
            for user in 0..count as u64 {
                queue.push(buffer(user));
            }
            let order = play_order(&mut queue);
            prop_assert_eq!(order, (0..count as u64).collect::<Vec<_>>());
        }

        #[test]
        fn loops_play_the_region_loop_count_times(
            before in 0usize..4,
            inside in 1usize..5,
            after in 0usize..4,
            loops in 1u32..6,
        ) {
            let mut queue = BufferQueue::new(Direction::Playback);
            let mut user = 0;
            for _ in 0..before {
                queue.push(buffer(user));
                user += 1;
            }
            let region_start = user;
            for index in 0..inside {
                let begin = index == 0;
                let end = index == inside - 1;
                queue.push(buffer(user).with_loop(begin, end, loops));
                user += 1;
            }
            for _ in 0..after {
                queue.push(buffer(user));
                user += 1;
            }

            let mut expected: Vec<u64> = (0..region_start).collect();
            for _ in 0..loops {
                expected.extend(region_start..region_start + inside as u64);
            }
            expected.extend(region_start + inside as u64..user);
            prop_assert_eq!(play_order(&mut queue), expected);
        }
    }
}
