//! Growable command ring between caller threads and a stream's engine thread.
//!
//! Callers append commands under a short lock and never fail for lack of
//! capacity: a full ring grows by a fixed increment. Synchronous commands
//! ([`Delivery::Wait`]) jump to the head of the ring so transport changes
//! preempt buffer submissions that are already queued, and their sender blocks
//! until the engine thread completes the attached [`CompletionSignal`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

/// Number of slots added each time the ring fills up.
pub const RING_INCREMENT: usize = 64;

const NO_TICKET: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("command ring is closed")]
    Closed,
    #[error("a synchronous command is already outstanding")]
    SyncOutstanding,
    #[error("out of memory while growing the command ring")]
    OutOfMemory,
    #[error("engine thread dropped the completion signal")]
    Disconnected,
}

/// How a command reaches the engine thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Append at the tail and return immediately.
    Post,
    /// Insert at the head and block until the engine thread replies.
    Wait,
}

/// A command refused by the ring, handed back to its sender.
pub struct Rejected<C> {
    pub command: C,
    pub reason: QueueError,
}

impl<C> fmt::Debug for Rejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<C> fmt::Display for Rejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command rejected: {}", self.reason)
    }
}

impl<C> std::error::Error for Rejected<C> {}

/// One-shot reply channel attached to a synchronous command.
///
/// The ring counts its synchronous command as outstanding until the signal is
/// completed or dropped.
pub struct CompletionSignal<R> {
    tx: Sender<R>,
    outstanding: Arc<AtomicU64>,
    ticket: u64,
}

impl<R> CompletionSignal<R> {
    fn new(outstanding: Arc<AtomicU64>, ticket: u64) -> (Self, Receiver<R>) {
        let (tx, rx) = bounded(1);
        let signal = Self {
            tx,
            outstanding,
            ticket,
        };
        (signal, rx)
    }

    /// Wakes the blocked sender with `reply`.
    pub fn complete(self, reply: R) {
        // Released first so the woken sender can issue its next command.
        self.release();
        // The sender may have given up already; nothing left to wake then.
        let _ = self.tx.send(reply);
    }

    fn release(&self) {
        // A newer ticket belongs to a later command and stays in place.
        let _ = self.outstanding.compare_exchange(
            self.ticket,
            NO_TICKET,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl<R> Drop for CompletionSignal<R> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<R> fmt::Debug for CompletionSignal<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionSignal")
    }
}

/// A queued command and, for synchronous delivery, its completion signal.
#[derive(Debug)]
pub struct Envelope<C, R> {
    pub command: C,
    pub signal: Option<CompletionSignal<R>>,
}

impl<C, R> Envelope<C, R> {
    pub fn is_sync(&self) -> bool {
        self.signal.is_some()
    }

    /// Completes the signal, if any, and returns the command.
    pub fn complete(self, reply: R) -> C {
        if let Some(signal) = self.signal {
            signal.complete(reply);
        }
        self.command
    }
}

struct RingState<C, R> {
    slots: Vec<Option<Envelope<C, R>>>,
    /// Next slot to read.
    head: usize,
    /// Next slot to write.
    tail: usize,
    signaled: bool,
    last_ticket: u64,
    closed: bool,
}

impl<C, R> RingState<C, R> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            signaled: false,
            last_ticket: NO_TICKET,
            closed: false,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        let capacity = self.capacity();
        (self.tail + capacity - self.head) % capacity
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % self.capacity() == self.head
    }

    /// Grows the ring by `increment` slots, moving the live entries to the
    /// start of the new storage so the wrapped segment stays in order.
    fn grow(&mut self, increment: usize) -> Result<(), QueueError> {
        let capacity = self.capacity();
        let len = self.len();
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity + increment)
            .map_err(|_| QueueError::OutOfMemory)?;
        for index in 0..len {
            slots.push(self.slots[(self.head + index) % capacity].take());
        }
        slots.resize_with(capacity + increment, || None);
        self.slots = slots;
        self.head = 0;
        self.tail = len;
        tracing::trace!(capacity = self.capacity(), "command ring grown");
        Ok(())
    }

    fn push_back(&mut self, envelope: Envelope<C, R>) {
        self.slots[self.tail] = Some(envelope);
        self.tail = (self.tail + 1) % self.capacity();
    }

    fn push_front(&mut self, envelope: Envelope<C, R>) {
        let capacity = self.capacity();
        self.head = (self.head + capacity - 1) % capacity;
        self.slots[self.head] = Some(envelope);
    }

    fn pop_front(&mut self) -> Option<Envelope<C, R>> {
        if self.head == self.tail {
            return None;
        }
        let envelope = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        envelope
    }

    fn take_all(&mut self) -> Vec<Envelope<C, R>> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(envelope) = self.pop_front() {
            drained.push(envelope);
        }
        self.signaled = false;
        drained
    }
}

/// Ordered, growable command channel feeding one engine thread.
pub struct CommandRing<C, R = ()> {
    state: Mutex<RingState<C, R>>,
    wake: Condvar,
    /// Ticket of the synchronous command whose sender is still waiting.
    outstanding: Arc<AtomicU64>,
    increment: usize,
}

impl<C, R> Default for CommandRing<C, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, R> CommandRing<C, R> {
    pub fn new() -> Self {
        Self::with_increment(RING_INCREMENT)
    }

    pub fn with_increment(increment: usize) -> Self {
        let increment = increment.max(2);
        Self {
            state: Mutex::new(RingState::with_capacity(increment)),
            wake: Condvar::new(),
            outstanding: Arc::new(AtomicU64::new(NO_TICKET)),
            increment,
        }
    }

    /// Sends `command` with the requested delivery. `Wait` returns the
    /// engine's reply; `Post` returns `None`. A refused `Post` command is
    /// dropped here, use [`CommandRing::post`] to get it back.
    pub fn submit(&self, command: C, delivery: Delivery) -> Result<Option<R>, QueueError> {
        match delivery {
            Delivery::Post => self
                .post(command)
                .map(|()| None)
                .map_err(|rejected| rejected.reason),
            Delivery::Wait => self.send_wait(command).map(Some),
        }
    }

    /// Appends `command` at the tail without blocking.
    pub fn post(&self, command: C) -> Result<(), Rejected<C>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Rejected {
                    command,
                    reason: QueueError::Closed,
                });
            }
            if state.is_full() {
                if let Err(reason) = state.grow(self.increment) {
                    return Err(Rejected { command, reason });
                }
            }
            state.push_back(Envelope {
                command,
                signal: None,
            });
            state.signaled = true;
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Inserts `command` at the head and blocks until the engine thread
    /// completes it.
    pub fn send_wait(&self, command: C) -> Result<R, QueueError> {
        let reply = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if self.outstanding.load(Ordering::Acquire) != NO_TICKET {
                return Err(QueueError::SyncOutstanding);
            }
            if state.is_full() {
                state.grow(self.increment)?;
            }
            state.last_ticket += 1;
            let ticket = state.last_ticket;
            self.outstanding.store(ticket, Ordering::Release);
            let (signal, reply) = CompletionSignal::new(Arc::clone(&self.outstanding), ticket);
            state.push_front(Envelope {
                command,
                signal: Some(signal),
            });
            state.signaled = true;
            reply
        };
        self.wake.notify_one();
        reply.recv().map_err(|_| QueueError::Disconnected)
    }

    /// Pops the head of the ring without blocking.
    pub fn try_take(&self) -> Option<Envelope<C, R>> {
        self.state.lock().pop_front()
    }

    /// Inspects the head of the ring without removing it.
    pub fn peek<T>(&self, inspect: impl FnOnce(&C) -> T) -> Option<T> {
        let state = self.state.lock();
        if state.head == state.tail {
            return None;
        }
        state.slots[state.head]
            .as_ref()
            .map(|envelope| inspect(&envelope.command))
    }

    /// Blocks until a command has been submitted since the last call or the
    /// timeout elapses. `None` waits indefinitely. Returns whether the wake
    /// event was signalled; the event is reset on return.
    pub fn block_until(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while !state.signaled && state.len() == 0 && !state.closed {
                    self.wake.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.signaled && state.len() == 0 && !state.closed {
                    if self.wake.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        std::mem::replace(&mut state.signaled, false)
    }

    /// Removes every pending entry in order and resets the wake event.
    pub fn drain(&self) -> Vec<Envelope<C, R>> {
        self.state.lock().take_all()
    }

    /// Refuses further submissions and returns whatever was still pending.
    pub fn close(&self) -> Vec<Envelope<C, R>> {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            state.take_all()
        };
        self.wake.notify_all();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot count. One slot is always kept free to tell full from empty.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn growth_keeps_wrapped_entries_in_order() {
        let ring: CommandRing<u32> = CommandRing::with_increment(4);
        // Move the cursors away from zero so the live segment wraps.
        for value in 0..3 {
            ring.post(value).unwrap();
        }
        for _ in 0..3 {
            ring.try_take().unwrap();
        }
        for value in 10..20 {
            ring.post(value).unwrap();
        }
        assert!(ring.capacity() > 4);
        let drained: Vec<u32> = ring
            .drain()
            .into_iter()
            .map(|envelope| envelope.command)
            .collect();
        assert_eq!(drained, (10..20).collect::<Vec<_>>());
    }

    #[test]
    fn wait_commands_preempt_posted_ones() {
        let ring: Arc<CommandRing<&'static str, u8>> = Arc::new(CommandRing::new());
        ring.post("buffer-1").unwrap();
        ring.post("buffer-2").unwrap();

        let sender = Arc::clone(&ring);
        let waiter = thread::spawn(move || sender.send_wait("pause"));

        while ring.len() < 3 {
            ring.block_until(Some(Duration::from_millis(5)));
        }
        let mut seen = Vec::new();
        while let Some(envelope) = ring.try_take() {
            seen.push(envelope.complete(7));
        }
        assert_eq!(seen, vec!["pause", "buffer-1", "buffer-2"]);
        assert_eq!(waiter.join().unwrap(), Ok(7));
    }

    #[test]
    fn one_wait_at_a_time_until_the_reply() {
        let ring: Arc<CommandRing<u32, u32>> = Arc::new(CommandRing::new());
        let first = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.send_wait(1))
        };
        while ring.len() < 1 {
            ring.block_until(Some(Duration::from_millis(5)));
        }
        // Taken by the engine but not answered yet.
        let envelope = ring.try_take().unwrap();
        assert_eq!(ring.send_wait(2), Err(QueueError::SyncOutstanding));
        assert!(ring.is_empty());

        assert_eq!(envelope.complete(10), 1);
        assert_eq!(first.join().unwrap(), Ok(10));

        let second = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.send_wait(2))
        };
        while ring.len() < 1 {
            ring.block_until(Some(Duration::from_millis(5)));
        }
        assert_eq!(ring.try_take().unwrap().complete(20), 2);
        assert_eq!(second.join().unwrap(), Ok(20));
    }

    #[test]
    fn dropped_signal_frees_the_wait_slot() {
        let ring: Arc<CommandRing<u32, u32>> = Arc::new(CommandRing::new());
        let engine = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for reply in [None, Some(7)] {
                    while ring.is_empty() {
                        ring.block_until(Some(Duration::from_millis(5)));
                    }
                    let envelope = ring.try_take().unwrap();
                    match reply {
                        Some(reply) => {
                            envelope.complete(reply);
                        }
                        None => drop(envelope),
                    }
                }
            })
        };
        assert_eq!(ring.send_wait(1), Err(QueueError::Disconnected));
        assert_eq!(ring.send_wait(2), Ok(7));
        engine.join().unwrap();
    }

    #[test]
    fn closed_ring_hands_commands_back() {
        let ring: CommandRing<u32> = CommandRing::new();
        ring.post(1).unwrap();
        let pending = ring.close();
        assert_eq!(pending.len(), 1);

        let rejected = ring.post(2).unwrap_err();
        assert_eq!(rejected.command, 2);
        assert_eq!(rejected.reason, QueueError::Closed);
        assert_eq!(ring.send_wait(3), Err(QueueError::Closed));
    }

    #[test]
    fn dropped_signal_reports_disconnect() {
        let ring: Arc<CommandRing<u32, u32>> = Arc::new(CommandRing::new());
        let engine = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                ring.block_until(None);
                drop(ring.try_take());
            })
        };
        assert_eq!(ring.send_wait(1), Err(QueueError::Disconnected));
        engine.join().unwrap();
    }

    #[test]
    fn block_until_times_out_without_commands() {
        let ring: CommandRing<u32> = CommandRing::new();
        let started = Instant::now();
        assert!(!ring.block_until(Some(Duration::from_millis(20))));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wake_event_resets_after_draining() {
        let ring: CommandRing<u32> = CommandRing::new();
        ring.post(1).unwrap();
        assert!(ring.block_until(Some(Duration::from_millis(1))));
        assert_eq!(ring.try_take().map(|envelope| envelope.command), Some(1));
        assert!(!ring.block_until(Some(Duration::from_millis(1))));
    }

    #[test]
    fn peek_leaves_the_head_in_place() {
        let ring: CommandRing<u32> = CommandRing::new();
        assert_eq!(ring.peek(|value| *value), None);
        ring.post(5).unwrap();
        assert_eq!(ring.peek(|value| *value * 2), Some(10));
        assert_eq!(ring.len(), 1);
    }
}
