//! One registered device: its pipeline plus broker-side bookkeeping
//!
//! The pipeline is opaque, so the session tracks which target ids are live
//! and which clients are subscribed; teardown decisions are made from this
//! bookkeeping alone. The bookkeeping lives in [`SessionEvents`], which is
//! also the pipeline's event sink, so targets the pipeline drops on its own
//! and callbacks pruned during dispatch are reflected there directly.

use crate::device::{DeviceIdentity, DeviceKey};
use crate::errors::BrokerError;
use crate::multiplexer::{CallbackMultiplexer, ClientCallback, ClientId, SessionEvent};
use crate::pipeline::{CameraPipeline, EventSink, PipelineError, RenderTargetEntry, TargetId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Serializable summary of a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub key: DeviceKey,
    pub name: String,
    pub connected: bool,
    pub recording: bool,
    pub clients: usize,
    pub targets: Vec<TargetId>,
    pub created_at: DateTime<Utc>,
}

/// Told when a session lost its last client or target outside a broker call.
pub trait IdleObserver: Send + Sync {
    fn session_idle(&self, key: &DeviceKey, events: &SessionEvents);
}

/// Client set and target set of one session, fed by its pipeline.
pub struct SessionEvents {
    key: DeviceKey,
    callbacks: CallbackMultiplexer,
    targets: Mutex<Vec<TargetId>>,
    observer: Option<Weak<dyn IdleObserver>>,
}

impl SessionEvents {
    pub fn new(key: DeviceKey) -> Self {
        Self {
            callbacks: CallbackMultiplexer::new(key.clone()),
            key,
            targets: Mutex::new(Vec::new()),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Weak<dyn IdleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn callbacks(&self) -> &CallbackMultiplexer {
        &self.callbacks
    }

    fn targets(&self) -> MutexGuard<'_, Vec<TargetId>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_target(&self, id: TargetId) -> bool {
        self.targets().contains(&id)
    }

    fn track_target(&self, id: TargetId) {
        let mut targets = self.targets();
        if !targets.contains(&id) {
            targets.push(id);
        }
    }

    /// Returns `false` if `id` was not tracked.
    fn forget_target(&self, id: TargetId) -> bool {
        let mut targets = self.targets();
        let before = targets.len();
        targets.retain(|t| *t != id);
        targets.len() != before
    }

    /// No subscribed clients and no render targets.
    pub fn is_idle(&self) -> bool {
        self.callbacks.is_empty() && self.targets().is_empty()
    }

    fn notify_idle(&self) {
        let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        log::debug!("{}: idle after pipeline event", self.key);
        observer.session_idle(&self.key, self);
    }
}

impl EventSink for SessionEvents {
    fn emit(&self, event: SessionEvent) {
        let dropped = match &event {
            SessionEvent::TargetDropped { target } => {
                let forgotten = self.forget_target(*target);
                if forgotten {
                    log::warn!("{}: pipeline dropped {}", self.key, target);
                }
                forgotten
            }
            _ => false,
        };
        let outcome = self.callbacks.dispatch(&event);
        if (dropped || outcome.pruned > 0) && self.is_idle() {
            self.notify_idle();
        }
    }
}

pub struct Session {
    key: DeviceKey,
    identity: DeviceIdentity,
    pipeline: Box<dyn CameraPipeline>,
    events: Arc<SessionEvents>,
    released: AtomicBool,
    created_at: DateTime<Utc>,
}

impl Session {
    /// `events` must be the sink `pipeline` was built with.
    pub fn new(
        identity: DeviceIdentity,
        pipeline: Box<dyn CameraPipeline>,
        events: Arc<SessionEvents>,
    ) -> Self {
        Self {
            key: identity.key(),
            identity,
            pipeline,
            events,
            released: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn callbacks(&self) -> &CallbackMultiplexer {
        self.events.callbacks()
    }

    /// Whether `events` is this session's sink.
    pub fn publishes_to(&self, events: &SessionEvents) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.events), events)
    }

    pub fn connect(&self) -> Result<(), BrokerError> {
        self.pipeline.connect().map_err(BrokerError::from)
    }

    pub fn disconnect(&self) -> Result<(), BrokerError> {
        self.pipeline.disconnect().map_err(BrokerError::from)
    }

    pub fn is_connected(&self) -> bool {
        !self.is_released() && self.pipeline.is_connected()
    }

    /// Returns `false` if the session was already released, including a
    /// release that lands while the target is being added.
    pub fn add_target(&self, entry: RenderTargetEntry) -> Result<bool, BrokerError> {
        if self.is_released() {
            return Ok(false);
        }
        let id = entry.id;
        match self.pipeline.add_target(entry) {
            Ok(()) => {}
            Err(PipelineError::Released) => {
                log::warn!("{}: released while adding {}", self.key, id);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        self.events.track_target(id);
        if self.is_released() {
            self.events.forget_target(id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Returns `false` if no target with `id` was added.
    ///
    /// The id stays tracked when the pipeline refuses the removal.
    pub fn remove_target(&self, id: TargetId) -> Result<bool, BrokerError> {
        if !self.events.has_target(id) {
            return Ok(false);
        }
        self.pipeline.remove_target(id)?;
        Ok(self.events.forget_target(id))
    }

    pub fn target_ids(&self) -> Vec<TargetId> {
        self.events.targets().clone()
    }

    pub fn target_count(&self) -> usize {
        self.events.targets().len()
    }

    pub fn is_recording(&self) -> bool {
        !self.is_released() && self.pipeline.is_recording()
    }

    pub fn start_recording(&self) -> Result<(), BrokerError> {
        if self.is_recording() {
            return Ok(());
        }
        self.pipeline.start_recording().map_err(BrokerError::from)
    }

    pub fn stop_recording(&self) -> Result<(), BrokerError> {
        if !self.is_recording() {
            return Ok(());
        }
        self.pipeline.stop_recording().map_err(BrokerError::from)
    }

    pub fn register_callback(&self, callback: &Arc<dyn ClientCallback>) -> bool {
        self.events.callbacks().register(callback)
    }

    pub fn unregister_callback(&self, id: ClientId) -> bool {
        self.events.callbacks().unregister(id)
    }

    pub fn client_count(&self) -> usize {
        self.events.callbacks().len()
    }

    /// No subscribed clients and no render targets.
    pub fn is_idle(&self) -> bool {
        self.events.is_idle()
    }

    /// Releases the pipeline. Only the first call has an effect.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        log::info!("Releasing session {}", self.key);
        self.pipeline.release();
        self.events.targets().clear();
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            key: self.key.clone(),
            name: self.identity.name.clone(),
            connected: self.is_connected(),
            recording: self.is_recording(),
            clients: self.client_count(),
            targets: self.target_ids(),
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("released", &self.is_released())
            .field("targets", &self.target_ids())
            .finish()
    }
}
