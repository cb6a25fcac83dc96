//! Scripted USB permission source
//!
//! Answers every permission request after a fixed delay, the way a user
//! tapping a system dialog would. Requests for a device whose answer is still
//! pending are recorded but not answered twice.

use crate::broker::Broker;
use crate::device::{DeviceIdentity, DeviceKey};
use crate::usb::{PermissionSource, UsbEvent};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedResponse {
    Grant,
    /// Answer with [`UsbEvent::Cancelled`].
    Deny,
    /// Never answer.
    Ignore,
}

#[derive(Clone)]
enum Delivery {
    Broker(Weak<Broker>),
    Channel(UnboundedSender<UsbEvent>),
}

impl Delivery {
    fn deliver(&self, event: UsbEvent) {
        match self {
            Delivery::Broker(broker) => {
                if let Some(broker) = broker.upgrade() {
                    if let Err(e) = broker.handle_usb_event(event) {
                        log::warn!("Scripted USB event rejected: {}", e);
                    }
                }
            }
            Delivery::Channel(tx) => {
                if tx.send(event).is_err() {
                    log::warn!("Scripted USB event dropped: pump stopped");
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ScriptedPermissionSource {
    response: ScriptedResponse,
    delay: Duration,
    delivery: Mutex<Option<Delivery>>,
    requests: Mutex<Vec<DeviceIdentity>>,
    pending: Arc<Mutex<HashSet<DeviceKey>>>,
}

impl ScriptedPermissionSource {
    pub fn new(response: ScriptedResponse, delay: Duration) -> Self {
        Self {
            response,
            delay,
            delivery: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn granting(delay: Duration) -> Self {
        Self::new(ScriptedResponse::Grant, delay)
    }

    pub fn denying(delay: Duration) -> Self {
        Self::new(ScriptedResponse::Deny, delay)
    }

    pub fn ignoring() -> Self {
        Self::new(ScriptedResponse::Ignore, Duration::ZERO)
    }

    /// Apply answers directly on `broker`.
    pub fn deliver_to(&self, broker: &Arc<Broker>) {
        *lock(&self.delivery) = Some(Delivery::Broker(Arc::downgrade(broker)));
    }

    /// Send answers to an event pump instead.
    pub fn deliver_via(&self, tx: UnboundedSender<UsbEvent>) {
        *lock(&self.delivery) = Some(Delivery::Channel(tx));
    }

    /// Drops the delivery target. Answers already scheduled still arrive.
    pub fn stop_delivery(&self) {
        lock(&self.delivery).take();
    }

    /// Every identity passed to `request_permission`, in call order.
    pub fn requests(&self) -> Vec<DeviceIdentity> {
        lock(&self.requests).clone()
    }
}

impl PermissionSource for ScriptedPermissionSource {
    fn request_permission(&self, identity: &DeviceIdentity) {
        lock(&self.requests).push(identity.clone());

        let event = match self.response {
            ScriptedResponse::Grant => UsbEvent::PermissionGranted(identity.clone()),
            ScriptedResponse::Deny => UsbEvent::Cancelled,
            ScriptedResponse::Ignore => return,
        };
        let Some(delivery) = lock(&self.delivery).clone() else {
            log::warn!("Scripted permission source has nowhere to deliver to");
            return;
        };

        let key = identity.key();
        if !lock(&self.pending).insert(key.clone()) {
            log::debug!("Permission for {} already pending", key);
            return;
        }

        let pending = self.pending.clone();
        let delay = self.delay;
        let spawned = std::thread::Builder::new()
            .name("uvcbroker-scripted-usb".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                delivery.deliver(event);
                lock(&pending).remove(&key);
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn scripted permission answer: {}", e);
            lock(&self.pending).remove(&identity.key());
        }
    }
}
