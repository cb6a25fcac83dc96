//! Counting mocks for pipelines, render targets and client callbacks

use crate::device::{DeviceIdentity, DeviceKey};
use crate::multiplexer::{CallbackError, ClientCallback, ClientId, SessionEvent};
use crate::pipeline::{
    CameraPipeline, EventSink, Frame, FrameListener, PipelineError, PipelineFactory, RenderTarget,
    RenderTargetEntry, TargetError, TargetId,
};
use crate::session::{Session, SessionEvents};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Number of calls that reached a [`MockPipeline`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub connect: usize,
    pub disconnect: usize,
    pub add_target: usize,
    pub remove_target: usize,
    pub start_recording: usize,
    pub stop_recording: usize,
    pub release: usize,
}

#[derive(Default)]
struct MockState {
    stats: Mutex<MockStats>,
    connected: AtomicBool,
    recording: AtomicBool,
    released: AtomicBool,
    refuse_removal: AtomicBool,
    targets: Mutex<Vec<TargetId>>,
}

/// Pipeline that only records calls and state transitions.
pub struct MockPipeline {
    state: Arc<MockState>,
    events: Arc<dyn EventSink>,
}

/// Test-side handle on a [`MockPipeline`]: reads its counters and drives
/// it from outside.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<MockState>,
    events: Arc<dyn EventSink>,
}

impl MockPipeline {
    pub fn new(events: Arc<dyn EventSink>) -> (Self, MockHandle) {
        let state = Arc::new(MockState::default());
        (
            Self {
                state: state.clone(),
                events: events.clone(),
            },
            MockHandle { state, events },
        )
    }

    fn count(&self, f: impl FnOnce(&mut MockStats)) {
        f(&mut lock(&self.state.stats));
    }
}

impl MockHandle {
    pub fn stats(&self) -> MockStats {
        *lock(&self.state.stats)
    }

    pub fn target_ids(&self) -> Vec<TargetId> {
        lock(&self.state.targets).clone()
    }

    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::Acquire)
    }

    /// Puts the pipeline in its terminal state without going through the
    /// session, as a release racing with the next call would.
    pub fn mark_released(&self) {
        self.state.released.store(true, Ordering::Release);
    }

    /// Makes `remove_target` fail until called again with `false`.
    pub fn refuse_removal(&self, refuse: bool) {
        self.state.refuse_removal.store(refuse, Ordering::Release);
    }

    /// Drops a target on the pipeline side and reports it, like a pipeline
    /// whose surface died.
    pub fn drop_target(&self, id: TargetId) {
        lock(&self.state.targets).retain(|t| *t != id);
        self.events.emit(SessionEvent::TargetDropped { target: id });
    }

    /// Emits an arbitrary event through the pipeline's sink.
    pub fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }
}

impl CameraPipeline for MockPipeline {
    fn connect(&self) -> Result<(), PipelineError> {
        self.count(|s| s.connect += 1);
        if self.state.released.load(Ordering::Acquire) {
            return Err(PipelineError::Released);
        }
        if !self.state.connected.swap(true, Ordering::AcqRel) {
            self.events.emit(SessionEvent::Connected);
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PipelineError> {
        self.count(|s| s.disconnect += 1);
        if self.state.connected.swap(false, Ordering::AcqRel) {
            self.events.emit(SessionEvent::Disconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    fn add_target(&self, entry: RenderTargetEntry) -> Result<(), PipelineError> {
        self.count(|s| s.add_target += 1);
        if self.state.released.load(Ordering::Acquire) {
            return Err(PipelineError::Released);
        }
        let mut targets = lock(&self.state.targets);
        if !targets.contains(&entry.id) {
            targets.push(entry.id);
        }
        Ok(())
    }

    fn remove_target(&self, id: TargetId) -> Result<(), PipelineError> {
        self.count(|s| s.remove_target += 1);
        if self.state.refuse_removal.load(Ordering::Acquire) {
            return Err(PipelineError::Thread("remove_target refused".to_string()));
        }
        lock(&self.state.targets).retain(|t| *t != id);
        Ok(())
    }

    fn start_recording(&self) -> Result<(), PipelineError> {
        self.count(|s| s.start_recording += 1);
        if !self.state.recording.swap(true, Ordering::AcqRel) {
            self.events.emit(SessionEvent::RecordingStarted);
        }
        Ok(())
    }

    fn stop_recording(&self) -> Result<(), PipelineError> {
        self.count(|s| s.stop_recording += 1);
        if self.state.recording.swap(false, Ordering::AcqRel) {
            self.events.emit(SessionEvent::RecordingStopped);
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.state.recording.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.count(|s| s.release += 1);
        if !self.state.released.swap(true, Ordering::AcqRel) {
            self.state.connected.store(false, Ordering::Release);
            self.state.recording.store(false, Ordering::Release);
            self.events.emit(SessionEvent::Released);
        }
    }
}

/// Factory handing out [`MockPipeline`]s and keeping their handles in
/// creation order.
#[derive(Default)]
pub struct MockPipelineFactory {
    handles: Mutex<Vec<MockHandle>>,
}

impl MockPipelineFactory {
    pub fn created(&self) -> usize {
        lock(&self.handles).len()
    }

    /// # Panics
    /// Panics if fewer than `index + 1` pipelines were created.
    pub fn pipeline(&self, index: usize) -> MockHandle {
        lock(&self.handles)[index].clone()
    }

    pub fn total_releases(&self) -> usize {
        lock(&self.handles).iter().map(|h| h.stats().release).sum()
    }
}

impl PipelineFactory for MockPipelineFactory {
    fn create(
        &self,
        _identity: &DeviceIdentity,
        events: Arc<dyn EventSink>,
    ) -> Result<Box<dyn CameraPipeline>, PipelineError> {
        let (pipeline, handle) = MockPipeline::new(events);
        lock(&self.handles).push(handle);
        Ok(Box::new(pipeline))
    }
}

/// Builds an unregistered session on a [`MockPipeline`].
pub fn mock_session(bus_path: &str) -> (Arc<Session>, MockHandle) {
    let identity = DeviceIdentity::new(0x0001, 0x0002, bus_path);
    let events = Arc::new(SessionEvents::new(identity.key()));
    let (pipeline, handle) = MockPipeline::new(events.clone());
    let session = Arc::new(Session::new(identity, Box::new(pipeline), events));
    (session, handle)
}

/// Client callback that stores every event it receives.
pub struct CollectingCallback {
    id: ClientId,
    events: Mutex<Vec<(DeviceKey, SessionEvent)>>,
    failing: AtomicBool,
}

impl CollectingCallback {
    pub fn new() -> Self {
        Self {
            id: ClientId::new(),
            events: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every following delivery fail as if the client went away.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn events(&self) -> Vec<(DeviceKey, SessionEvent)> {
        lock(&self.events).clone()
    }

    pub fn frames(&self) -> usize {
        lock(&self.events)
            .iter()
            .filter(|(_, e)| matches!(e, SessionEvent::FrameAvailable { .. }))
            .count()
    }

    pub fn saw(&self, event: &SessionEvent) -> bool {
        lock(&self.events).iter().any(|(_, e)| e == event)
    }
}

impl Default for CollectingCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCallback for CollectingCallback {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn on_event(&self, key: &DeviceKey, event: &SessionEvent) -> Result<(), CallbackError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(CallbackError::Disconnected);
        }
        lock(&self.events).push((key.clone(), event.clone()));
        Ok(())
    }
}

/// Render target and frame listener that counts what it receives.
#[derive(Default)]
pub struct CountingTarget {
    frames: AtomicU64,
    notifications: AtomicU64,
    failing: bool,
}

impl CountingTarget {
    /// A target whose surface is already gone.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Acquire)
    }
}

impl RenderTarget for CountingTarget {
    fn render(&self, _frame: &Frame) -> Result<(), TargetError> {
        if self.failing {
            return Err(TargetError("surface destroyed".to_string()));
        }
        self.frames.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl FrameListener for CountingTarget {
    fn on_frame_available(&self, _target: TargetId, _frame: &Frame) {
        self.notifications.fetch_add(1, Ordering::AcqRel);
    }
}

/// Event sink that keeps everything a pipeline emits.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SessionEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, event: &SessionEvent) -> usize {
        lock(&self.events).iter().filter(|e| *e == event).count()
    }

    pub fn frames(&self) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| matches!(e, SessionEvent::FrameAvailable { .. }))
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SessionEvent) {
        lock(&self.events).push(event);
    }
}
