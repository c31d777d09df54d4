//! Queued and direct PCM streaming on dedicated engine threads.
//!
//! A [`StreamHandle`] owns one engine thread that feeds caller-supplied
//! [`WaveBuffer`]s to a [`wavepipe_backends::PcmDevice`] and hands them back
//! through a [`NotificationSink`] once they have been heard (or recorded).
//! [`DirectStreamSession`] skips the queue and streams straight into the
//! memory-mapped hardware ring. [`DeviceRegistry`] keeps track of both.

pub mod buffer;
pub mod config;
mod device;
pub mod direct;
pub mod error;
mod feeder;
pub mod handle;
pub mod metrics;
pub mod mixer;
mod notify;
mod queue;
pub mod recovery;
pub mod registry;
pub mod rt;
pub mod sink;

pub use buffer::{BufferFlags, WaveBuffer};
pub use config::{ConfigError, EngineConfig, DEFAULT_VOLUME_ELEMENT};
pub use direct::DirectStreamSession;
pub use error::{EngineError, SubmitError};
pub use handle::StreamHandle;
pub use metrics::{MetricsSnapshot, StreamMetrics};
pub use mixer::{MixerControl, VolumeReading};
pub use recovery::{classify, ErrorClass, ErrorRecovery, SuspendPolicy};
pub use registry::{DeviceId, DeviceRegistry, SharedSession};
pub use sink::{ChannelSink, NotificationSink, StreamEvent};

pub use wavepipe_rt::{
    Direction, DirectRenderer, PcmFormat, RegionInfo, SampleEncoding, StreamState, StreamTime,
    TimeFormat,
};
