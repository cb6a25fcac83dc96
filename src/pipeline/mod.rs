//! Capture pipeline seam
//!
//! The broker never decodes video itself. Each session owns one
//! [`CameraPipeline`] built by a [`PipelineFactory`] when the device is
//! granted; frames and state changes flow back through an [`EventSink`].

pub mod synthetic;

use crate::device::DeviceIdentity;
use crate::multiplexer::SessionEvent;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use synthetic::{SyntheticPipeline, SyntheticPipelineFactory};

/// Identifier of a render target, scoped to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

/// One captured frame as handed to render targets.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub data: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline already released")]
    Released,
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("capture thread error: {0}")]
    Thread(String),
}

#[derive(Debug, thiserror::Error)]
#[error("render target failed: {0}")]
pub struct TargetError(pub String);

/// Destination a session streams frames into (display surface, encoder input).
pub trait RenderTarget: Send + Sync {
    fn render(&self, frame: &Frame) -> Result<(), TargetError>;
}

/// Per-target notification used by observer clients.
pub trait FrameListener: Send + Sync {
    fn on_frame_available(&self, target: TargetId, frame: &Frame);
}

/// Receives the pipeline's asynchronous notifications.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

#[derive(Clone)]
pub struct RenderTargetEntry {
    pub id: TargetId,
    pub handle: Arc<dyn RenderTarget>,
    pub recordable: bool,
    pub listener: Option<Arc<dyn FrameListener>>,
}

impl RenderTargetEntry {
    pub fn new(id: TargetId, handle: Arc<dyn RenderTarget>, recordable: bool) -> Self {
        Self {
            id,
            handle,
            recordable,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn FrameListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

impl fmt::Debug for RenderTargetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTargetEntry")
            .field("id", &self.id)
            .field("recordable", &self.recordable)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

/// Control surface of one device's capture pipeline.
///
/// Every method must be safe to call concurrently and from any state:
/// connecting a connected pipeline or stopping an idle recording is a no-op.
/// `release` is terminal and idempotent.
pub trait CameraPipeline: Send + Sync {
    fn connect(&self) -> Result<(), PipelineError>;
    fn disconnect(&self) -> Result<(), PipelineError>;
    fn is_connected(&self) -> bool;
    /// Adding an id that already exists replaces the previous entry.
    fn add_target(&self, entry: RenderTargetEntry) -> Result<(), PipelineError>;
    fn remove_target(&self, id: TargetId) -> Result<(), PipelineError>;
    fn start_recording(&self) -> Result<(), PipelineError>;
    fn stop_recording(&self) -> Result<(), PipelineError>;
    fn is_recording(&self) -> bool;
    fn release(&self);
}

/// Builds the pipeline for a freshly granted device.
pub trait PipelineFactory: Send + Sync {
    fn create(
        &self,
        identity: &DeviceIdentity,
        events: Arc<dyn EventSink>,
    ) -> Result<Box<dyn CameraPipeline>, PipelineError>;
}
