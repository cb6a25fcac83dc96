//! USB attach/permission source seam and the event pump feeding the broker

use crate::broker::Broker;
use crate::device::DeviceIdentity;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events emitted by the USB layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    Attached(DeviceIdentity),
    PermissionGranted(DeviceIdentity),
    Detached(DeviceIdentity),
    /// The user dismissed a permission request.
    Cancelled,
}

/// Asks the OS/user for access to a device.
///
/// Fire and forget: the outcome arrives later as a [`UsbEvent`].
pub trait PermissionSource: Send + Sync {
    fn request_permission(&self, identity: &DeviceIdentity);
}

/// Applies every event received on `rx` to `broker` until the sender closes.
///
/// Broker calls release pipelines and may join capture threads, so each event
/// is handled on the blocking pool. Returns the number of events handled.
pub fn spawn_event_pump(broker: Arc<Broker>, mut rx: mpsc::UnboundedReceiver<UsbEvent>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        log::info!("USB event pump started");
        let mut handled = 0usize;
        while let Some(event) = rx.recv().await {
            log::debug!("USB event: {:?}", event);
            let broker = broker.clone();
            match tokio::task::spawn_blocking(move || broker.handle_usb_event(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Failed to apply USB event: {}", e),
                Err(e) => log::error!("Task join error: {}", e),
            }
            handled += 1;
        }
        log::info!("USB event pump stopped after {} events", handled);
        handled
    })
}
