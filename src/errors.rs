use crate::device::DeviceKey;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// A second session was inserted for a key that already has one.
    DuplicateSession(String),
    PermissionDenied(String),
    Timeout(String),
    NotFound(String),
    PoisonedLock(String),
    Pipeline(String),
    Config(String),
}

impl BrokerError {
    pub fn duplicate_session(key: &DeviceKey) -> Self {
        BrokerError::DuplicateSession(format!("session already registered for {}", key))
    }

    pub fn permission_denied(key: &DeviceKey) -> Self {
        BrokerError::PermissionDenied(format!("failed to open USB device {} (no permission)", key))
    }

    pub fn timeout(key: &DeviceKey, waited_ms: u128) -> Self {
        BrokerError::Timeout(format!(
            "no session for {} after waiting {}ms for permission",
            key, waited_ms
        ))
    }

    pub fn not_found(key: &DeviceKey) -> Self {
        BrokerError::NotFound(format!("no live session for {}", key))
    }

    pub fn poisoned_lock() -> Self {
        BrokerError::PoisonedLock("registry lock poisoned by previous panic".to_string())
    }

    /// Whether the caller may reasonably retry the operation.
    ///
    /// Permission and timing outcomes are ordinary results; everything else
    /// points at a bug or a broken collaborator.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BrokerError::PermissionDenied(_) | BrokerError::Timeout(_) | BrokerError::NotFound(_)
        )
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BrokerError::DuplicateSession(msg) => write!(f, "Duplicate session: {}", msg),
            BrokerError::PermissionDenied(msg) => write!(f, "Permission denied error: {}", msg),
            BrokerError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            BrokerError::NotFound(msg) => write!(f, "Session not found: {}", msg),
            BrokerError::PoisonedLock(msg) => write!(f, "Poisoned lock: {}", msg),
            BrokerError::Pipeline(msg) => write!(f, "Pipeline error: {}", msg),
            BrokerError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<crate::pipeline::PipelineError> for BrokerError {
    fn from(error: crate::pipeline::PipelineError) -> Self {
        BrokerError::Pipeline(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let key = DeviceKey::from_raw("/dev/bus/usb/001/004");
        assert!(BrokerError::timeout(&key, 2000).is_recoverable());
        assert!(BrokerError::permission_denied(&key).is_recoverable());
        assert!(BrokerError::not_found(&key).is_recoverable());
        assert!(!BrokerError::duplicate_session(&key).is_recoverable());
        assert!(!BrokerError::poisoned_lock().is_recoverable());
    }

    #[test]
    fn test_display_mentions_key() {
        let key = DeviceKey::from_raw("/dev/bus/usb/002/007");
        let msg = BrokerError::permission_denied(&key).to_string();
        assert!(msg.starts_with("Permission denied error"));
        assert!(msg.contains("/dev/bus/usb/002/007"));
    }
}
