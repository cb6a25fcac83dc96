//! Testing utilities for the broker
//!
//! Scripted stand-ins for the external collaborators (USB permission source,
//! capture pipeline, remote clients) so the broker can be exercised offline.

pub mod mocks;
pub mod scripted_usb;

pub use mocks::{
    mock_session, CollectingCallback, CountingTarget, MockHandle, MockPipeline, MockPipelineFactory,
    MockStats, RecordingSink,
};
pub use scripted_usb::{ScriptedPermissionSource, ScriptedResponse};
