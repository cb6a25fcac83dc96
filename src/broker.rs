//! Client-facing broker
//!
//! Layers the permission-wait protocol and reference-counted teardown on top
//! of [`SessionRegistry`]. Registry mutations happen under the registry lock;
//! every pipeline call happens after it is released.

use crate::client::{ControlClient, ObserverClient};
use crate::config::BrokerConfig;
use crate::device::{DeviceIdentity, DeviceKey};
use crate::errors::BrokerError;
use crate::multiplexer::{ClientCallback, ClientId};
use crate::pipeline::{PipelineFactory, RenderTargetEntry, TargetId};
use crate::registry::{SessionRegistry, WaitOutcome};
use crate::session::{IdleObserver, Session, SessionEvents, SessionInfo};
use crate::usb::{PermissionSource, UsbEvent};
use std::sync::{Arc, Weak};
use std::time::Instant;

pub struct Broker {
    this: Weak<Broker>,
    registry: SessionRegistry,
    permissions: Arc<dyn PermissionSource>,
    factory: Arc<dyn PipelineFactory>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        permissions: Arc<dyn PermissionSource>,
        factory: Arc<dyn PipelineFactory>,
    ) -> Arc<Self> {
        log::info!(
            "Starting broker (select timeout {}ms)",
            config.broker.select_timeout_ms
        );
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry: SessionRegistry::new(),
            permissions,
            factory,
            config,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Binds a full-control client that subscribes with `callback`.
    pub fn control_client(self: &Arc<Self>, callback: Arc<dyn ClientCallback>) -> ControlClient {
        log::debug!("Binding control client {}", callback.client_id());
        ControlClient::new(self.clone(), callback)
    }

    /// Binds an observer client that can only attach render targets.
    pub fn observer_client(self: &Arc<Self>) -> ObserverClient {
        log::debug!("Binding observer client");
        ObserverClient::new(self.clone())
    }

    /// Called when a client unbinds; reaps stale sessions if configured to.
    pub fn unbind(&self) -> Result<usize, BrokerError> {
        if !self.config.broker.reap_on_unbind {
            return Ok(0);
        }
        let reaped = self.registry.remove_stale()?;
        log::debug!("Client unbound, reaped {} stale sessions", reaped);
        Ok(reaped)
    }

    /// Obtains the session for `identity`, asking for permission and waiting
    /// for the grant when none is registered yet.
    pub fn select(
        &self,
        identity: &DeviceIdentity,
        callback: &Arc<dyn ClientCallback>,
    ) -> Result<DeviceKey, BrokerError> {
        let key = identity.key();
        let timeout = self.config.broker.select_timeout();
        let started = Instant::now();
        let deadline = started + timeout;
        log::debug!("select: device={} client={}", key, callback.client_id());

        let mut requested = false;
        loop {
            let session = match self.registry.get(&key)? {
                Some(session) => session,
                None => {
                    if !requested {
                        log::info!("Requesting permission for {}", key);
                        self.permissions.request_permission(identity);
                        requested = true;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.registry.get_or_wait(&key, remaining)? {
                        WaitOutcome::Ready(session) => session,
                        WaitOutcome::Cancelled => {
                            log::warn!("Permission request for {} was cancelled", key);
                            return Err(BrokerError::permission_denied(&key));
                        }
                        WaitOutcome::TimedOut | WaitOutcome::Absent => {
                            log::warn!("No permission grant for {} within {:?}", key, timeout);
                            return Err(BrokerError::timeout(&key, started.elapsed().as_millis()));
                        }
                    }
                }
            };

            if self.registry.attach_client(&session, callback)? {
                log::info!(
                    "Client {} selected {} ({} clients)",
                    callback.client_id(),
                    key,
                    session.client_count()
                );
                return Ok(key);
            }

            // Torn down between lookup and registration; the next grant
            // needs a fresh permission request.
            log::debug!("Session {} vanished before registration, retrying", key);
            requested = false;
            if Instant::now() >= deadline {
                return Err(BrokerError::timeout(&key, started.elapsed().as_millis()));
            }
        }
    }

    /// Unregisters `client`; tears the session down once nothing references it.
    pub fn release_client(&self, key: &DeviceKey, client: ClientId) -> Result<(), BrokerError> {
        match self.registry.detach_client(key, client)? {
            Some(session) => {
                log::info!("Last client released {}", session.key());
                session.release();
            }
            None => log::debug!("release: {} still referenced or absent", key),
        }
        Ok(())
    }

    /// Releases every session.
    pub fn release_all(&self) -> Result<usize, BrokerError> {
        let sessions = self.registry.drain()?;
        let count = sessions.len();
        for session in sessions {
            session.release();
        }
        log::info!("Released all sessions ({})", count);
        Ok(count)
    }

    /// Reaps stale sessions, releases the rest and wakes any parked selects.
    pub fn shutdown(&self) -> Result<(), BrokerError> {
        log::info!("Shutting down broker");
        self.registry.remove_stale()?;
        self.release_all()?;
        self.registry.cancel_waiters()
    }

    fn lookup(&self, key: &DeviceKey) -> Result<Arc<Session>, BrokerError> {
        self.registry
            .get(key)?
            .ok_or_else(|| BrokerError::not_found(key))
    }

    fn observe(&self, key: &DeviceKey) -> Option<Arc<Session>> {
        match self.registry.get(key) {
            Ok(session) => session,
            Err(e) => {
                log::error!("Lookup of {} failed: {}", key, e);
                None
            }
        }
    }

    pub fn connect(&self, key: &DeviceKey) -> Result<(), BrokerError> {
        log::debug!("connect: {}", key);
        self.lookup(key)?.connect()
    }

    pub fn disconnect(&self, key: &DeviceKey) -> Result<(), BrokerError> {
        log::debug!("disconnect: {}", key);
        self.lookup(key)?.disconnect()
    }

    pub fn add_render_target(&self, key: &DeviceKey, entry: RenderTargetEntry) -> Result<(), BrokerError> {
        log::debug!("add_render_target: {} {:?}", key, entry);
        let Some(session) = self.observe(key) else {
            log::warn!("Cannot add {} to {}: no live session", entry.id, key);
            return Ok(());
        };
        if !session.add_target(entry)? {
            log::warn!("Session {} was released while adding a target", key);
        }
        Ok(())
    }

    pub fn remove_render_target(&self, key: &DeviceKey, id: TargetId) -> Result<(), BrokerError> {
        log::debug!("remove_render_target: {} {}", key, id);
        let Some(session) = self.observe(key) else {
            log::warn!("Cannot remove {} from {}: no live session", id, key);
            return Ok(());
        };
        if session.remove_target(id)? {
            if let Some(idle) = self.registry.reap_if_idle(session.key())? {
                log::info!("Last target removed from unreferenced session {}", idle.key());
                idle.release();
            }
        }
        Ok(())
    }

    pub fn start_recording(&self, key: &DeviceKey) -> Result<(), BrokerError> {
        match self.observe(key) {
            Some(session) => session.start_recording(),
            None => Ok(()),
        }
    }

    pub fn stop_recording(&self, key: &DeviceKey) -> Result<(), BrokerError> {
        match self.observe(key) {
            Some(session) => session.stop_recording(),
            None => Ok(()),
        }
    }

    pub fn is_selected(&self, key: &DeviceKey) -> bool {
        self.observe(key).is_some()
    }

    pub fn is_connected(&self, key: &DeviceKey) -> bool {
        self.observe(key).is_some_and(|s| s.is_connected())
    }

    pub fn is_recording(&self, key: &DeviceKey) -> bool {
        self.observe(key).is_some_and(|s| s.is_recording())
    }

    pub fn snapshot(&self) -> Result<Vec<SessionInfo>, BrokerError> {
        let mut infos: Vec<SessionInfo> = self.registry.sessions()?.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }

    /// Applies one event from the USB attach/permission source.
    pub fn handle_usb_event(&self, event: UsbEvent) -> Result<(), BrokerError> {
        match event {
            UsbEvent::Attached(identity) => {
                log::info!("Device attached: {} ({})", identity.key(), identity.name);
                Ok(())
            }
            UsbEvent::PermissionGranted(identity) => self.on_permission_granted(identity),
            UsbEvent::Detached(identity) => {
                let key = identity.key();
                log::info!("Device detached: {}", key);
                if let Some(session) = self.registry.remove(&key)? {
                    session.release();
                }
                Ok(())
            }
            UsbEvent::Cancelled => {
                log::info!("Permission request cancelled");
                self.registry.cancel_waiters()
            }
        }
    }

    fn on_permission_granted(&self, identity: DeviceIdentity) -> Result<(), BrokerError> {
        let key = identity.key();
        if self.registry.get(&key)?.is_some() {
            log::warn!("Session already exists before grant for {}", key);
            return Err(BrokerError::duplicate_session(&key));
        }

        let observer: Weak<dyn IdleObserver> = self.this.clone();
        let events = Arc::new(SessionEvents::new(key.clone()).with_observer(observer));
        let pipeline = self.factory.create(&identity, events.clone())?;
        let session = Arc::new(Session::new(identity, pipeline, events));

        if let Err(e) = self.registry.insert(session.clone()) {
            log::error!("Discarding pipeline for {}: {}", key, e);
            session.release();
            return Err(e);
        }
        log::info!("Permission granted, session ready: {}", key);
        Ok(())
    }
}

impl IdleObserver for Broker {
    /// A dropped target or a pruned callback left the session unreferenced.
    fn session_idle(&self, key: &DeviceKey, events: &SessionEvents) {
        match self.registry.reap_idle_publisher(key, events) {
            Ok(Some(session)) => {
                log::info!("Session {} lost its last reference, releasing", key);
                session.release();
            }
            Ok(None) => {}
            Err(e) => log::error!("Reaping idle session {} failed: {}", key, e),
        }
    }
}
