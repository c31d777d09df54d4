//! Recovery from transient hardware errors.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wavepipe_backends::{PcmDevice, PcmError, PcmState};

use crate::metrics::StreamMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Buffer underrun/overrun, or a stream that simply needs preparing.
    Underrun,
    /// The system suspended the device.
    Suspended,
    /// Anything else. The stream cannot continue.
    Fatal,
}

pub fn classify(err: &PcmError) -> ErrorClass {
    match err {
        PcmError::Underrun | PcmError::BadState(PcmState::Setup) => ErrorClass::Underrun,
        PcmError::Suspended => ErrorClass::Suspended,
        _ => ErrorClass::Fatal,
    }
}

/// How long to keep retrying `resume` on a suspended device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspendPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for SuspendPolicy {
    fn default() -> Self {
        Self {
            retries: 100,
            interval: Duration::from_millis(10),
        }
    }
}

pub struct ErrorRecovery {
    policy: SuspendPolicy,
    metrics: Arc<StreamMetrics>,
}

impl ErrorRecovery {
    pub fn new(policy: SuspendPolicy, metrics: Arc<StreamMetrics>) -> Self {
        Self { policy, metrics }
    }

    /// Brings the device back to a usable state after `err`. Fatal errors are
    /// returned unchanged.
    pub fn recover(&mut self, pcm: &mut dyn PcmDevice, err: PcmError) -> Result<(), PcmError> {
        match classify(&err) {
            ErrorClass::Underrun => {
                tracing::warn!(?err, device = pcm.hardware_id(), "xrun, preparing stream");
                self.metrics.register_xrun();
                self.prepare(pcm)?;
            }
            ErrorClass::Suspended => {
                tracing::warn!(device = pcm.hardware_id(), "stream suspended, resuming");
                self.metrics.register_suspend();
                self.resume(pcm)?;
            }
            ErrorClass::Fatal => {
                tracing::error!(?err, device = pcm.hardware_id(), "unrecoverable pcm error");
                self.metrics.register_fatal();
                return Err(err);
            }
        }
        self.metrics.register_recovery();
        Ok(())
    }

    /// Inspects the device state directly and recovers from an xrun or
    /// suspend without waiting for a failed transfer. Returns whether a
    /// recovery took place.
    pub fn check_state(&mut self, pcm: &mut dyn PcmDevice) -> Result<bool, PcmError> {
        match pcm.state() {
            PcmState::Xrun => self.recover(pcm, PcmError::Underrun).map(|()| true),
            PcmState::Suspended => self.recover(pcm, PcmError::Suspended).map(|()| true),
            PcmState::Disconnected => self.recover(pcm, PcmError::Disconnected).map(|()| false),
            _ => Ok(false),
        }
    }

    fn prepare(&mut self, pcm: &mut dyn PcmDevice) -> Result<(), PcmError> {
        pcm.prepare().map_err(|err| {
            tracing::error!(?err, "prepare failed during recovery");
            self.metrics.register_fatal();
            err
        })
    }

    fn resume(&mut self, pcm: &mut dyn PcmDevice) -> Result<(), PcmError> {
        let mut attempts = 0;
        loop {
            match pcm.resume() {
                Ok(()) => return Ok(()),
                Err(PcmError::Again) if attempts < self.policy.retries => {
                    attempts += 1;
                    thread::sleep(self.policy.interval);
                }
                Err(err) => {
                    tracing::debug!(?err, attempts, "resume failed, preparing instead");
                    return self.prepare(pcm);
                }
            }
        }
    }
}
