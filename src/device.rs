//! Device identity and registry keys
//!
//! A [`DeviceKey`] is derived from the full identity of an attached USB
//! device instead of a hash of it, so two identical camera models plugged in
//! side by side never share a key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of a physical USB device as reported by the attach source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Kernel device path, e.g. `/dev/bus/usb/001/004`. The trailing device
    /// number is reassigned on every attachment.
    pub bus_path: String,
    pub serial: Option<String>,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, bus_path: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            bus_path: bus_path.into(),
            serial: None,
            name: String::new(),
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::from(self)
    }
}

/// Registry key for one physical attachment.
///
/// The empty key is the "any device" selector accepted by lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct DeviceKey(Arc<str>);

impl DeviceKey {
    /// Selector meaning "any currently present session".
    pub fn any() -> Self {
        DeviceKey(Arc::from(""))
    }

    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    /// Rebuild a key from its string form (as handed to remote clients).
    pub fn from_raw(raw: impl AsRef<str>) -> Self {
        DeviceKey(Arc::from(raw.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&DeviceIdentity> for DeviceKey {
    fn from(identity: &DeviceIdentity) -> Self {
        let mut raw = format!(
            "{}#{:04x}:{:04x}",
            identity.bus_path, identity.vendor_id, identity.product_id
        );
        if let Some(serial) = &identity.serial {
            raw.push('#');
            raw.push_str(serial);
        }
        DeviceKey(Arc::from(raw))
    }
}

impl From<String> for DeviceKey {
    fn from(raw: String) -> Self {
        DeviceKey(Arc::from(raw))
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.0.to_string()
    }
}

impl Default for DeviceKey {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "<any>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
