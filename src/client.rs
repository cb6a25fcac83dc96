//! Capability-restricted views over one shared [`Broker`]
//!
//! [`ControlClient`] carries select/release rights and owns the subscriber
//! callback it registers with. [`ObserverClient`] can only attach render
//! targets to sessions some other client selected.

use crate::broker::Broker;
use crate::device::{DeviceIdentity, DeviceKey};
use crate::errors::BrokerError;
use crate::multiplexer::{ClientCallback, ClientId};
use crate::pipeline::{FrameListener, RenderTarget, RenderTargetEntry, TargetId};
use std::sync::Arc;

pub struct ControlClient {
    broker: Arc<Broker>,
    callback: Arc<dyn ClientCallback>,
}

impl ControlClient {
    pub(crate) fn new(broker: Arc<Broker>, callback: Arc<dyn ClientCallback>) -> Self {
        Self { broker, callback }
    }

    pub fn client_id(&self) -> ClientId {
        self.callback.client_id()
    }

    pub fn select(&self, identity: &DeviceIdentity) -> Result<DeviceKey, BrokerError> {
        self.broker.select(identity, &self.callback)
    }

    pub fn release(&self, key: &DeviceKey) -> Result<(), BrokerError> {
        self.broker.release_client(key, self.client_id())
    }

    pub fn is_selected(&self, key: &DeviceKey) -> bool {
        self.broker.is_selected(key)
    }

    pub fn release_all(&self) -> Result<usize, BrokerError> {
        self.broker.release_all()
    }

    pub fn connect(&self, key: &DeviceKey) -> Result<(), BrokerError> {
        self.broker.connect(key)
    }

    pub fn disconnect(&self, key: &DeviceKey) -> Result<(), BrokerError> {
        self.broker.disconnect(key)
    }

    pub fn is_connected(&self, key: &DeviceKey) -> bool {
        self.broker.is_connected(key)
    }

    pub fn add_surface(
        &self,
        key: &DeviceKey,
        id: TargetId,
        handle: Arc<dyn RenderTarget>,
        recordable: bool,
    ) -> Result<(), BrokerError> {
        self.broker
            .add_render_target(key, RenderTargetEntry::new(id, handle, recordable))
    }

    pub fn remove_surface(&self, key: &DeviceKey, id: TargetId) -> Result<(), BrokerError> {
        self.broker.remove_render_target(key, id)
    }

    pub fn is_recording(&self, key: &DeviceKey) -> bool {
        self.broker.is_recording(key)
    }

    pub fn start_recording(&self, key: &DeviceKey) -> Result<(), BrokerError> {
        self.broker.start_recording(key)
    }

    pub fn stop_recording(&self, key: &DeviceKey) -> Result<(), BrokerError> {
        self.broker.stop_recording(key)
    }

    /// Drops this binding and lets the broker reap stale sessions.
    pub fn unbind(self) -> Result<usize, BrokerError> {
        log::debug!("Unbinding control client {}", self.client_id());
        self.broker.unbind()
    }
}

pub struct ObserverClient {
    broker: Arc<Broker>,
}

impl ObserverClient {
    pub(crate) fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn is_selected(&self, key: &DeviceKey) -> bool {
        self.broker.is_selected(key)
    }

    pub fn is_connected(&self, key: &DeviceKey) -> bool {
        self.broker.is_connected(key)
    }

    pub fn add_surface(
        &self,
        key: &DeviceKey,
        id: TargetId,
        handle: Arc<dyn RenderTarget>,
        recordable: bool,
        listener: Option<Arc<dyn FrameListener>>,
    ) -> Result<(), BrokerError> {
        let mut entry = RenderTargetEntry::new(id, handle, recordable);
        if let Some(listener) = listener {
            entry = entry.with_listener(listener);
        }
        self.broker.add_render_target(key, entry)
    }

    pub fn remove_surface(&self, key: &DeviceKey, id: TargetId) -> Result<(), BrokerError> {
        self.broker.remove_render_target(key, id)
    }

    pub fn unbind(self) -> Result<usize, BrokerError> {
        log::debug!("Unbinding observer client");
        self.broker.unbind()
    }
}
