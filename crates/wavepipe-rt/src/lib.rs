//! Real-time primitives shared across the wavepipe streaming engine.

pub mod callback;
pub mod clock;
pub mod queue;
pub mod transport;

pub use callback::{DirectRenderer, RegionInfo};
pub use clock::PositionClock;
pub use queue::{CommandRing, CompletionSignal, Delivery, Envelope, QueueError, Rejected};
pub use transport::{
    decode_state, encode_state, Direction, FormatError, PcmFormat, SampleEncoding, Smpte,
    StreamState, StreamTime, TimeFormat,
};
