use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::buffer::WaveBuffer;

/// Notifications delivered on the engine thread.
#[derive(Debug)]
pub enum StreamEvent {
    Opened,
    /// A buffer left the queue. `forced` is set when it was returned by a
    /// reset or a fatal error instead of being played or recorded.
    BufferCompleted { buffer: WaveBuffer, forced: bool },
    Closed,
}

/// Receives stream notifications. Called synchronously on the engine thread,
/// so implementations must return quickly.
pub trait NotificationSink: Send {
    fn notify(&mut self, event: StreamEvent);
}

impl<F> NotificationSink for F
where
    F: FnMut(StreamEvent) + Send,
{
    fn notify(&mut self, event: StreamEvent) {
        self(event)
    }
}

/// Forwards notifications over a channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<StreamEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&mut self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("notification receiver dropped");
        }
    }
}
