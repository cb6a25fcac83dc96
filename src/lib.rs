//! uvcbroker: share USB cameras between many clients
//!
//! A [`Broker`] keeps at most one live capture session per physical device
//! and lets any number of clients attach to it. The first client to select a
//! device triggers the USB permission request and blocks until the grant
//! arrives; later clients reuse the session. The pipeline is released once the
//! last client callback and the last render target are gone.
//!
//! # Features
//! - One session per device key, shared across clients
//! - Bounded, cancellable waits for USB permission grants
//! - Reference-counted teardown with no pipeline work under the registry lock
//! - Event fan-out to every subscribed client
//! - Synthetic pipeline and scripted USB source for offline use
//!
//! # Usage
//! ```rust,ignore
//! use std::sync::Arc;
//! use uvcbroker::{Broker, BrokerConfig, DeviceIdentity, SyntheticPipelineFactory};
//!
//! let config = BrokerConfig::load_or_default();
//! let factory = Arc::new(SyntheticPipelineFactory::new(config.pipeline.clone()));
//! let broker = Broker::new(config, permission_source, factory);
//! let client = broker.control_client(my_callback);
//! let key = client.select(&DeviceIdentity::new(0x046d, 0x0825, "/dev/bus/usb/001/004"))?;
//! client.connect(&key)?;
//! ```
pub mod broker;
pub mod client;
pub mod config;
pub mod device;
pub mod errors;
pub mod multiplexer;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod usb;

// Scripted collaborators and mocks for offline testing
pub mod testing;

// Re-exports for convenience
pub use broker::Broker;
pub use client::{ControlClient, ObserverClient};
pub use config::{BrokerConfig, BrokerSettings, PipelineSettings};
pub use device::{DeviceIdentity, DeviceKey};
pub use errors::BrokerError;
pub use multiplexer::{
    CallbackError, CallbackMultiplexer, ClientCallback, ClientId, Dispatch, SessionEvent,
};
pub use pipeline::{
    CameraPipeline, EventSink, Frame, FrameListener, PipelineError, PipelineFactory, RenderTarget,
    RenderTargetEntry, SyntheticPipeline, SyntheticPipelineFactory, TargetError, TargetId,
};
pub use registry::{SessionRegistry, WaitOutcome};
pub use session::{IdleObserver, Session, SessionEvents, SessionInfo};
pub use usb::{spawn_event_pump, PermissionSource, UsbEvent};

/// Initialize logging for the broker
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "uvcbroker=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}
