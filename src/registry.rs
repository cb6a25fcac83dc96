//! Session registry
//!
//! A single mutex guards the key → session map; a condition variable wakes
//! every parked waiter whenever the map changes or a cancel is broadcast.
//! Waiters always re-check their own key after waking, since one broadcast
//! serves every key.
//!
//! Pipeline operations (connect, release, ...) are never invoked with the
//! registry lock held. Only the session's own bookkeeping locks nest inside it.

use crate::device::DeviceKey;
use crate::errors::BrokerError;
use crate::multiplexer::{ClientCallback, ClientId};
use crate::session::{Session, SessionEvents};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Result of [`SessionRegistry::get_or_wait`].
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Ready(Arc<Session>),
    /// The any-key found no session; never blocks.
    Absent,
    TimedOut,
    /// A cancel broadcast arrived while parked.
    Cancelled,
}

impl WaitOutcome {
    pub fn session(self) -> Option<Arc<Session>> {
        match self {
            WaitOutcome::Ready(session) => Some(session),
            _ => None,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<DeviceKey, Arc<Session>>,
    cancel_generation: u64,
}

impl RegistryState {
    fn lookup(&self, key: &DeviceKey) -> Option<&Arc<Session>> {
        if key.is_any() {
            self.sessions.values().next()
        } else {
            self.sessions.get(key)
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    changed: Condvar,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>, BrokerError> {
        self.state.lock().map_err(|_| BrokerError::poisoned_lock())
    }

    pub fn insert(&self, session: Arc<Session>) -> Result<(), BrokerError> {
        let key = session.key().clone();
        let mut state = self.lock()?;
        if state.sessions.contains_key(&key) {
            return Err(BrokerError::duplicate_session(&key));
        }
        state.sessions.insert(key.clone(), session);
        log::debug!("Registered session {} ({} total)", key, state.sessions.len());
        self.changed.notify_all();
        Ok(())
    }

    /// Non-blocking lookup. The any-key yields an arbitrary present session.
    pub fn get(&self, key: &DeviceKey) -> Result<Option<Arc<Session>>, BrokerError> {
        Ok(self.lock()?.lookup(key).cloned())
    }

    /// Looks up `key`, parking until it appears, `timeout` elapses, or
    /// [`cancel_waiters`](Self::cancel_waiters) is called.
    pub fn get_or_wait(&self, key: &DeviceKey, timeout: Duration) -> Result<WaitOutcome, BrokerError> {
        let mut state = self.lock()?;

        if key.is_any() {
            return Ok(match state.lookup(key) {
                Some(session) => WaitOutcome::Ready(session.clone()),
                None => WaitOutcome::Absent,
            });
        }

        let deadline = Instant::now() + timeout;
        let generation = state.cancel_generation;
        loop {
            if let Some(session) = state.sessions.get(key) {
                return Ok(WaitOutcome::Ready(session.clone()));
            }
            if state.cancel_generation != generation {
                log::debug!("Wait for {} cancelled", key);
                return Ok(WaitOutcome::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }

            log::debug!("Waiting for session {} to become ready", key);
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .map_err(|_| BrokerError::poisoned_lock())?;
            state = guard;
        }
    }

    pub fn remove(&self, key: &DeviceKey) -> Result<Option<Arc<Session>>, BrokerError> {
        let mut state = self.lock()?;
        let removed = state.sessions.remove(key);
        if removed.is_some() {
            log::debug!("Removed session {} ({} left)", key, state.sessions.len());
        }
        self.changed.notify_all();
        Ok(removed)
    }

    /// Removes and releases every session that is not connected and has
    /// neither clients nor render targets. Returns how many were reaped.
    pub fn remove_stale(&self) -> Result<usize, BrokerError> {
        let candidates: Vec<Arc<Session>> = self.lock()?.sessions.values().cloned().collect();
        // Connection state comes from the pipeline, so it is read unlocked.
        let disconnected: Vec<Arc<Session>> = candidates
            .into_iter()
            .filter(|s| !s.is_connected())
            .collect();
        if disconnected.is_empty() {
            return Ok(0);
        }

        let mut reaped = Vec::new();
        {
            let mut state = self.lock()?;
            for session in disconnected {
                let still_registered = state
                    .sessions
                    .get(session.key())
                    .is_some_and(|s| Arc::ptr_eq(s, &session));
                if still_registered && session.is_idle() {
                    state.sessions.remove(session.key());
                    reaped.push(session);
                }
            }
            if !reaped.is_empty() {
                self.changed.notify_all();
            }
        }

        for session in &reaped {
            log::info!("Reaping stale session {}", session.key());
            session.release();
        }
        Ok(reaped.len())
    }

    /// Atomically removes every session.
    pub fn drain(&self) -> Result<Vec<Arc<Session>>, BrokerError> {
        let mut state = self.lock()?;
        let drained: Vec<Arc<Session>> = state.sessions.drain().map(|(_, s)| s).collect();
        self.changed.notify_all();
        Ok(drained)
    }

    /// Wakes every parked waiter with [`WaitOutcome::Cancelled`].
    pub fn cancel_waiters(&self) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state.cancel_generation = state.cancel_generation.wrapping_add(1);
        self.changed.notify_all();
        Ok(())
    }

    /// Registers `callback` on `session` only if it is still the registered
    /// session for its key. Returns `false` when it was removed meanwhile.
    pub fn attach_client(
        &self,
        session: &Arc<Session>,
        callback: &Arc<dyn ClientCallback>,
    ) -> Result<bool, BrokerError> {
        let state = self.lock()?;
        match state.sessions.get(session.key()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                session.register_callback(callback);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Unregisters `client` and removes the session if it became idle.
    ///
    /// With the any-key, the session holding `client` is used. The removed
    /// session is returned for the caller to release outside the registry
    /// lock.
    pub fn detach_client(
        &self,
        key: &DeviceKey,
        client: ClientId,
    ) -> Result<Option<Arc<Session>>, BrokerError> {
        let mut state = self.lock()?;
        let found = if key.is_any() {
            state
                .sessions
                .values()
                .find(|s| s.callbacks().contains(client))
                .cloned()
        } else {
            state.sessions.get(key).cloned()
        };
        let Some(session) = found else {
            return Ok(None);
        };
        session.unregister_callback(client);
        Ok(self.remove_if_idle(&mut state, session))
    }

    /// Removes the session for `key` if it has no clients and no targets.
    pub fn reap_if_idle(&self, key: &DeviceKey) -> Result<Option<Arc<Session>>, BrokerError> {
        let mut state = self.lock()?;
        let Some(session) = state.lookup(key).cloned() else {
            return Ok(None);
        };
        Ok(self.remove_if_idle(&mut state, session))
    }

    /// Like [`reap_if_idle`](Self::reap_if_idle), but only for the session
    /// publishing through `events`. A newer session under the same key is
    /// left alone.
    pub fn reap_idle_publisher(
        &self,
        key: &DeviceKey,
        events: &SessionEvents,
    ) -> Result<Option<Arc<Session>>, BrokerError> {
        let mut state = self.lock()?;
        let Some(session) = state.sessions.get(key).filter(|s| s.publishes_to(events)).cloned() else {
            return Ok(None);
        };
        Ok(self.remove_if_idle(&mut state, session))
    }

    fn remove_if_idle(&self, state: &mut RegistryState, session: Arc<Session>) -> Option<Arc<Session>> {
        if !session.is_idle() {
            return None;
        }
        state.sessions.remove(session.key());
        self.changed.notify_all();
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.lock().is_ok_and(|s| s.lookup(key).is_some())
    }

    pub fn sessions(&self) -> Result<Vec<Arc<Session>>, BrokerError> {
        Ok(self.lock()?.sessions.values().cloned().collect())
    }
}
