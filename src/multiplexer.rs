//! Per-session fan-out of pipeline notifications to client callbacks
//!
//! The multiplexer only keeps [`Weak`] references: a client that drops its
//! callback without releasing stops counting at once and is removed on the
//! next dispatch.

use crate::device::DeviceKey;
use crate::pipeline::TargetId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use uuid::Uuid;

/// Token identifying one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        ClientId(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected,
    Disconnected,
    RecordingStarted,
    RecordingStopped,
    FrameAvailable { sequence: u64, timestamp_us: u64 },
    /// The pipeline gave up on a render target after it failed.
    TargetDropped { target: TargetId },
    Released,
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("client disconnected")]
    Disconnected,
    #[error("client callback failed: {0}")]
    Failed(String),
}

/// A subscriber to one or more sessions.
pub trait ClientCallback: Send + Sync {
    fn client_id(&self) -> ClientId;
    fn on_event(&self, key: &DeviceKey, event: &SessionEvent) -> Result<(), CallbackError>;
}

/// Outcome of one [`CallbackMultiplexer::dispatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub delivered: usize,
    /// Registrations removed because the callback failed or its owner is gone.
    pub pruned: usize,
}

struct Registration {
    id: ClientId,
    callback: Weak<dyn ClientCallback>,
}

pub struct CallbackMultiplexer {
    key: DeviceKey,
    callbacks: Mutex<Vec<Registration>>,
}

impl CallbackMultiplexer {
    pub fn new(key: DeviceKey) -> Self {
        Self {
            key,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn callbacks(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `false` when the client was already registered.
    pub fn register(&self, callback: &Arc<dyn ClientCallback>) -> bool {
        let id = callback.client_id();
        let mut callbacks = self.callbacks();
        callbacks.retain(|r| r.callback.strong_count() > 0);
        if callbacks.iter().any(|r| r.id == id) {
            return false;
        }
        callbacks.push(Registration {
            id,
            callback: Arc::downgrade(callback),
        });
        log::debug!("{}: registered client {} ({} total)", self.key, id, callbacks.len());
        true
    }

    /// Returns `false` when the client was not registered.
    pub fn unregister(&self, id: ClientId) -> bool {
        let mut callbacks = self.callbacks();
        let removed = callbacks.iter().any(|r| r.id == id);
        callbacks.retain(|r| r.id != id && r.callback.strong_count() > 0);
        if removed {
            log::debug!("{}: unregistered client {} ({} left)", self.key, id, callbacks.len());
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.callbacks()
            .iter()
            .any(|r| r.id == id && r.callback.strong_count() > 0)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.callbacks()
            .iter()
            .filter(|r| r.callback.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every live callback.
    ///
    /// Callbacks run without the registration lock held. A callback that
    /// fails, or whose owner has gone away, is deregistered.
    pub fn dispatch(&self, event: &SessionEvent) -> Dispatch {
        let mut dead = Vec::new();
        let live: Vec<(ClientId, Arc<dyn ClientCallback>)> = self
            .callbacks()
            .iter()
            .filter_map(|r| match r.callback.upgrade() {
                Some(cb) => Some((r.id, cb)),
                None => {
                    dead.push(r.id);
                    None
                }
            })
            .collect();

        let mut delivered = 0;
        for (id, callback) in live {
            match callback.on_event(&self.key, event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("{}: dropping client {}: {}", self.key, id, e);
                    dead.push(id);
                }
            }
        }

        let mut pruned = 0;
        if !dead.is_empty() {
            let mut callbacks = self.callbacks();
            let before = callbacks.len();
            callbacks.retain(|r| !dead.contains(&r.id));
            pruned = before - callbacks.len();
        }
        Dispatch { delivered, pruned }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CollectingCallback;

    fn key() -> DeviceKey {
        DeviceKey::from_raw("/dev/bus/usb/001/004#046d:0825")
    }

    #[test]
    fn test_register_is_idempotent_per_client() {
        let mux = CallbackMultiplexer::new(key());
        let cb: Arc<dyn ClientCallback> = Arc::new(CollectingCallback::new());

        assert!(mux.register(&cb));
        assert!(!mux.register(&cb));
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let mux = CallbackMultiplexer::new(key());
        assert!(!mux.unregister(ClientId::new()));
        assert!(mux.is_empty());
    }

    #[test]
    fn test_dispatch_reaches_every_client() {
        let mux = CallbackMultiplexer::new(key());
        let a = Arc::new(CollectingCallback::new());
        let b = Arc::new(CollectingCallback::new());
        let a_dyn: Arc<dyn ClientCallback> = a.clone();
        let b_dyn: Arc<dyn ClientCallback> = b.clone();
        mux.register(&a_dyn);
        mux.register(&b_dyn);

        let outcome = mux.dispatch(&SessionEvent::Connected);
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.pruned, 0);
        assert_eq!(a.events(), vec![(key(), SessionEvent::Connected)]);
        assert_eq!(b.events(), vec![(key(), SessionEvent::Connected)]);
    }

    #[test]
    fn test_failing_client_is_isolated_and_dropped() {
        let mux = CallbackMultiplexer::new(key());
        let healthy = Arc::new(CollectingCallback::new());
        let broken = Arc::new(CollectingCallback::new());
        broken.set_failing(true);
        let healthy_dyn: Arc<dyn ClientCallback> = healthy.clone();
        let broken_dyn: Arc<dyn ClientCallback> = broken.clone();
        mux.register(&broken_dyn);
        mux.register(&healthy_dyn);

        let outcome = mux.dispatch(&SessionEvent::RecordingStarted);
        assert_eq!(outcome, Dispatch { delivered: 1, pruned: 1 });
        assert_eq!(healthy.events().len(), 1);
        assert!(!mux.contains(broken.client_id()));
        assert_eq!(mux.len(), 1);

        // Not retried on later events.
        broken.set_failing(false);
        mux.dispatch(&SessionEvent::RecordingStopped);
        assert!(broken.events().is_empty());
    }

    #[test]
    fn test_weak_registration_does_not_extend_lifetime() {
        let mux = CallbackMultiplexer::new(key());
        let cb: Arc<dyn ClientCallback> = Arc::new(CollectingCallback::new());
        mux.register(&cb);
        assert_eq!(mux.len(), 1);

        drop(cb);
        assert_eq!(mux.len(), 0);
        assert_eq!(mux.dispatch(&SessionEvent::Disconnected).delivered, 0);
    }

    #[test]
    fn test_dispatch_counts_dropped_owner_as_pruned() {
        let mux = CallbackMultiplexer::new(key());
        let cb: Arc<dyn ClientCallback> = Arc::new(CollectingCallback::new());
        mux.register(&cb);
        drop(cb);

        let outcome = mux.dispatch(&SessionEvent::Connected);
        assert_eq!(outcome, Dispatch { delivered: 0, pruned: 1 });
    }

    #[test]
    fn test_target_dropped_event_serializes_with_id() {
        let json = serde_json::to_string(&SessionEvent::TargetDropped { target: TargetId(4) }).unwrap();
        assert_eq!(json, r#"{"type":"target_dropped","target":4}"#);
    }
}
