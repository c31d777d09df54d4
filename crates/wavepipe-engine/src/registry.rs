//! Table of open streams and direct sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use wavepipe_backends::{ControlDevice, PcmDevice};
use wavepipe_rt::{DirectRenderer, PcmFormat};

use crate::config::EngineConfig;
use crate::direct::DirectStreamSession;
use crate::error::EngineError;
use crate::handle::StreamHandle;
use crate::sink::NotificationSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

pub type SharedSession = Arc<Mutex<DirectStreamSession>>;

pub struct DeviceRegistry {
    config: EngineConfig,
    next_id: AtomicU64,
    streams: RwLock<HashMap<DeviceId, Arc<StreamHandle>>>,
    sessions: RwLock<HashMap<DeviceId, SharedSession>>,
    /// Hardware identifiers held by a direct session.
    bound: RwLock<HashMap<String, DeviceId>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl DeviceRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            streams: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            bound: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn allocate_id(&self) -> DeviceId {
        DeviceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn ensure_unbound(&self, hardware_id: &str) -> Result<(), EngineError> {
        if self.bound.read().contains_key(hardware_id) {
            return Err(EngineError::DirectSessionBusy(hardware_id.to_string()));
        }
        Ok(())
    }

    pub fn open_stream(
        &self,
        format: PcmFormat,
        pcm: Box<dyn PcmDevice>,
        control: Option<Box<dyn ControlDevice>>,
        sink: Box<dyn NotificationSink>,
    ) -> Result<DeviceId, EngineError> {
        self.ensure_unbound(pcm.hardware_id())?;
        let handle = StreamHandle::open(format, pcm, control, sink, &self.config)?;
        let id = self.allocate_id();
        self.streams.write().insert(id, Arc::new(handle));
        tracing::debug!(%id, "registered stream");
        Ok(id)
    }

    /// Opens a direct session. Each hardware device takes one session at a
    /// time.
    pub fn open_direct(
        &self,
        pcm: Box<dyn PcmDevice>,
        renderer: Option<Box<dyn DirectRenderer>>,
    ) -> Result<DeviceId, EngineError> {
        let hardware_id = pcm.hardware_id().to_string();
        let mut bound = self.bound.write();
        if bound.contains_key(&hardware_id) {
            return Err(EngineError::DirectSessionBusy(hardware_id));
        }
        let session = DirectStreamSession::open(pcm, renderer, &self.config)?;
        let id = self.allocate_id();
        bound.insert(hardware_id, id);
        self.sessions
            .write()
            .insert(id, Arc::new(Mutex::new(session)));
        tracing::debug!(%id, "registered direct session");
        Ok(id)
    }

    pub fn stream(&self, id: DeviceId) -> Result<Arc<StreamHandle>, EngineError> {
        self.streams
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::BadDeviceId(id.0))
    }

    pub fn direct(&self, id: DeviceId) -> Result<SharedSession, EngineError> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::BadDeviceId(id.0))
    }

    /// Closes a queued stream. The stream stays registered when the close is
    /// refused because buffers are still queued; a stream whose device is
    /// gone is unregistered and the error returned.
    pub fn close(&self, id: DeviceId) -> Result<(), EngineError> {
        let handle = self.stream(id)?;
        let result = handle.close();
        if result == Err(EngineError::StillPlaying) {
            return result;
        }
        self.streams.write().remove(&id);
        tracing::debug!(%id, "stream unregistered");
        result
    }

    /// Stops and releases a direct session, freeing its hardware.
    pub fn close_direct(&self, id: DeviceId) -> Result<(), EngineError> {
        let session = self
            .sessions
            .write()
            .remove(&id)
            .ok_or(EngineError::BadDeviceId(id.0))?;
        self.bound.write().retain(|_, owner| *owner != id);
        let result = session.lock().stop();
        tracing::debug!(%id, "direct session unregistered");
        result
    }

    pub fn stream_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.streams.read().keys().copied().collect();
        ids.sort();
        ids
    }
}
