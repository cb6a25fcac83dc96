//! Software camera pipeline
//!
//! Produces gradient RGB frames on a dedicated capture thread so the broker
//! can be driven end to end without hardware.

use super::{
    CameraPipeline, EventSink, Frame, PipelineError, PipelineFactory, RenderTargetEntry, TargetId,
};
use crate::config::PipelineSettings;
use crate::device::DeviceIdentity;
use crate::multiplexer::SessionEvent;
use bytes::Bytes;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct CaptureThread {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    label: String,
    settings: PipelineSettings,
    events: Arc<dyn EventSink>,
    targets: Mutex<Vec<RenderTargetEntry>>,
    recording: AtomicBool,
    released: AtomicBool,
    next_sequence: AtomicU64,
    start_instant: Instant,
}

impl Inner {
    fn targets(&self) -> MutexGuard<'_, Vec<RenderTargetEntry>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct SyntheticPipeline {
    inner: Arc<Inner>,
    capture: Mutex<Option<CaptureThread>>,
}

impl SyntheticPipeline {
    pub fn new(label: impl Into<String>, settings: PipelineSettings, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                settings,
                events,
                targets: Mutex::new(Vec::new()),
                recording: AtomicBool::new(false),
                released: AtomicBool::new(false),
                next_sequence: AtomicU64::new(1),
                start_instant: Instant::now(),
            }),
            capture: Mutex::new(None),
        }
    }

    pub fn target_ids(&self) -> Vec<TargetId> {
        self.inner.targets().iter().map(|t| t.id).collect()
    }

    fn capture(&self) -> MutexGuard<'_, Option<CaptureThread>> {
        self.capture.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_not_released(&self) -> Result<(), PipelineError> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(PipelineError::Released);
        }
        Ok(())
    }

    fn stop_capture(&self) -> bool {
        let thread = self.capture().take();
        let Some(thread) = thread else {
            return false;
        };

        let _ = thread.stop_tx.send(());
        // A listener reacting to a frame may disconnect from the capture
        // thread itself; joining there would never return.
        if thread.handle.thread().id() == std::thread::current().id() {
            log::debug!("{}: disconnect requested from capture thread", self.inner.label);
        } else if thread.handle.join().is_err() {
            log::warn!("{}: capture thread panicked", self.inner.label);
        }
        true
    }
}

impl CameraPipeline for SyntheticPipeline {
    fn connect(&self) -> Result<(), PipelineError> {
        self.ensure_not_released()?;
        let mut capture = self.capture();
        if capture.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let inner = self.inner.clone();
        let interval = frame_interval(self.inner.settings.fps);
        let handle = std::thread::Builder::new()
            .name("uvcbroker-synthetic-capture".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => deliver_frame(&inner),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| PipelineError::Thread(format!("spawn failed: {e}")))?;

        *capture = Some(CaptureThread { stop_tx, handle });
        drop(capture);

        log::info!("{}: connected", self.inner.label);
        self.inner.events.emit(SessionEvent::Connected);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PipelineError> {
        if self.inner.recording.swap(false, Ordering::AcqRel) {
            self.inner.events.emit(SessionEvent::RecordingStopped);
        }
        if self.stop_capture() {
            log::info!("{}: disconnected", self.inner.label);
            self.inner.events.emit(SessionEvent::Disconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.capture().is_some()
    }

    fn add_target(&self, entry: RenderTargetEntry) -> Result<(), PipelineError> {
        self.ensure_not_released()?;
        let mut targets = self.inner.targets();
        match targets.iter_mut().find(|t| t.id == entry.id) {
            Some(existing) => {
                log::debug!("{}: replacing {}", self.inner.label, entry.id);
                *existing = entry;
            }
            None => targets.push(entry),
        }
        Ok(())
    }

    fn remove_target(&self, id: TargetId) -> Result<(), PipelineError> {
        self.inner.targets().retain(|t| t.id != id);
        Ok(())
    }

    fn start_recording(&self) -> Result<(), PipelineError> {
        self.ensure_not_released()?;
        if !self.inner.recording.swap(true, Ordering::AcqRel) {
            log::info!("{}: recording started", self.inner.label);
            self.inner.events.emit(SessionEvent::RecordingStarted);
        }
        Ok(())
    }

    fn stop_recording(&self) -> Result<(), PipelineError> {
        if self.inner.recording.swap(false, Ordering::AcqRel) {
            log::info!("{}: recording stopped", self.inner.label);
            self.inner.events.emit(SessionEvent::RecordingStopped);
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::Acquire)
    }

    fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.disconnect();
        self.inner.targets().clear();
        log::info!("{}: released", self.inner.label);
        self.inner.events.emit(SessionEvent::Released);
    }
}

impl Drop for SyntheticPipeline {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(fps.max(1)))
}

fn deliver_frame(inner: &Inner) {
    let Some(frame) = synthetic_frame(inner) else {
        log::warn!(
            "{}: cannot allocate a {}x{} frame",
            inner.label, inner.settings.width, inner.settings.height
        );
        return;
    };
    let recording = inner.recording.load(Ordering::Acquire);
    let targets: Vec<RenderTargetEntry> = inner.targets().clone();

    let mut failed = Vec::new();
    for target in targets.iter().filter(|t| recording || !t.recordable) {
        if let Err(e) = target.handle.render(&frame) {
            log::warn!("{}: dropping {}: {}", inner.label, target.id, e);
            failed.push(target.id);
            continue;
        }
        if let Some(listener) = &target.listener {
            listener.on_frame_available(target.id, &frame);
        }
    }
    if !failed.is_empty() {
        inner.targets().retain(|t| !failed.contains(&t.id));
        // Emitted unlocked: the session may be released from inside emit.
        for target in failed {
            inner.events.emit(SessionEvent::TargetDropped { target });
        }
        if inner.released.load(Ordering::Acquire) {
            return;
        }
    }

    inner.events.emit(SessionEvent::FrameAvailable {
        sequence: frame.sequence,
        timestamp_us: frame.timestamp_us,
    });
}

/// Byte length of one RGB frame, `None` if it does not fit in memory.
fn frame_len(width: u32, height: u32) -> Option<usize> {
    usize::try_from(width)
        .ok()?
        .checked_mul(usize::try_from(height).ok()?)?
        .checked_mul(3)
}

fn synthetic_frame(inner: &Inner) -> Option<Frame> {
    let width = inner.settings.width;
    let height = inner.settings.height;
    let len = frame_len(width, height)?;
    let sequence = inner.next_sequence.fetch_add(1, Ordering::Relaxed);

    // Gradient that shifts every frame.
    let base = (sequence % 256) as u8;
    let mut data = vec![0u8; len];
    for (i, pixel) in data.chunks_exact_mut(3).enumerate() {
        let x = i % width as usize;
        let y = i / width as usize;
        pixel[0] = base.wrapping_add((x % 256) as u8);
        pixel[1] = base.wrapping_add((y % 256) as u8);
        pixel[2] = base.wrapping_add(((x + y) % 256) as u8);
    }

    Some(Frame {
        sequence,
        timestamp_us: inner.start_instant.elapsed().as_micros() as u64,
        width,
        height,
        format: inner.settings.format.clone(),
        data: Bytes::from(data),
    })
}

/// Builds a [`SyntheticPipeline`] per granted device.
#[derive(Debug, Clone, Default)]
pub struct SyntheticPipelineFactory {
    settings: PipelineSettings,
}

impl SyntheticPipelineFactory {
    pub fn new(settings: PipelineSettings) -> Self {
        Self { settings }
    }
}

impl PipelineFactory for SyntheticPipelineFactory {
    fn create(
        &self,
        identity: &DeviceIdentity,
        events: Arc<dyn EventSink>,
    ) -> Result<Box<dyn CameraPipeline>, PipelineError> {
        let (width, height) = (self.settings.width, self.settings.height);
        if width == 0 || height == 0 || frame_len(width, height).is_none() {
            return Err(PipelineError::Open(format!(
                "invalid resolution {}x{}",
                width, height
            )));
        }
        let label = if identity.name.is_empty() {
            identity.bus_path.clone()
        } else {
            format!("{} ({})", identity.name, identity.bus_path)
        };
        Ok(Box::new(SyntheticPipeline::new(label, self.settings.clone(), events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingTarget, RecordingSink};

    fn tiny_settings() -> PipelineSettings {
        PipelineSettings {
            width: 8,
            height: 6,
            fps: 200,
            format: "RGB24".to_string(),
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_connect_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = SyntheticPipeline::new("test", tiny_settings(), sink.clone());

        pipeline.connect().unwrap();
        pipeline.connect().unwrap();
        assert!(pipeline.is_connected());

        pipeline.disconnect().unwrap();
        pipeline.disconnect().unwrap();
        assert!(!pipeline.is_connected());

        assert_eq!(sink.count(&SessionEvent::Connected), 1);
        assert_eq!(sink.count(&SessionEvent::Disconnected), 1);
    }

    #[test]
    fn test_frames_reach_targets() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = SyntheticPipeline::new("test", tiny_settings(), sink.clone());
        let target = Arc::new(CountingTarget::default());

        pipeline
            .add_target(RenderTargetEntry::new(TargetId(1), target.clone(), false))
            .unwrap();
        pipeline.connect().unwrap();

        assert!(wait_for(|| target.frames() >= 3));
        pipeline.release();
        assert!(sink.frames() >= 3);
    }

    #[test]
    fn test_recordable_target_only_fed_while_recording() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = SyntheticPipeline::new("test", tiny_settings(), sink);
        let preview = Arc::new(CountingTarget::default());
        let recorder = Arc::new(CountingTarget::default());

        pipeline
            .add_target(RenderTargetEntry::new(TargetId(1), preview.clone(), false))
            .unwrap();
        pipeline
            .add_target(RenderTargetEntry::new(TargetId(2), recorder.clone(), true))
            .unwrap();
        pipeline.connect().unwrap();

        assert!(wait_for(|| preview.frames() >= 3));
        assert_eq!(recorder.frames(), 0);

        pipeline.start_recording().unwrap();
        assert!(wait_for(|| recorder.frames() >= 2));
        pipeline.release();
    }

    #[test]
    fn test_failing_target_is_dropped_and_reported() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = SyntheticPipeline::new("test", tiny_settings(), sink.clone());
        let broken = Arc::new(CountingTarget::failing());
        let healthy = Arc::new(CountingTarget::default());

        pipeline
            .add_target(RenderTargetEntry::new(TargetId(7), broken, false))
            .unwrap();
        pipeline
            .add_target(RenderTargetEntry::new(TargetId(8), healthy.clone(), false))
            .unwrap();
        pipeline.connect().unwrap();

        assert!(wait_for(|| pipeline.target_ids() == vec![TargetId(8)]));
        assert!(wait_for(|| healthy.frames() >= 3));
        pipeline.release();
        assert_eq!(sink.count(&SessionEvent::TargetDropped { target: TargetId(7) }), 1);
        assert_eq!(sink.count(&SessionEvent::TargetDropped { target: TargetId(8) }), 0);
    }

    #[test]
    fn test_frame_len_rejects_overflow() {
        assert_eq!(frame_len(8, 6), Some(144));
        assert_eq!(frame_len(u32::MAX, u32::MAX), None);
        if usize::BITS == 32 {
            assert_eq!(frame_len(65_536, 65_536), None);
        }
    }

    #[test]
    fn test_frame_layout_matches_resolution() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = SyntheticPipeline::new("test", tiny_settings(), sink);
        let frame = synthetic_frame(&pipeline.inner).unwrap();
        assert_eq!(frame.data.len(), 8 * 6 * 3);
        // Pixel (x=2, y=1) of the first frame, base 1.
        let idx = (8 + 2) * 3;
        assert_eq!(&frame.data[idx..idx + 3], &[3, 2, 4]);
    }

    #[test]
    fn test_duplicate_target_id_replaces_entry() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = SyntheticPipeline::new("test", tiny_settings(), sink);
        let first = Arc::new(CountingTarget::default());
        let second = Arc::new(CountingTarget::default());

        pipeline
            .add_target(RenderTargetEntry::new(TargetId(1), first.clone(), false))
            .unwrap();
        pipeline
            .add_target(RenderTargetEntry::new(TargetId(1), second.clone(), false))
            .unwrap();
        assert_eq!(pipeline.target_ids(), vec![TargetId(1)]);

        pipeline.connect().unwrap();
        assert!(wait_for(|| second.frames() >= 2));
        pipeline.release();
        assert_eq!(first.frames(), 0);
    }

    #[test]
    fn test_release_is_terminal() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = SyntheticPipeline::new("test", tiny_settings(), sink.clone());

        pipeline.connect().unwrap();
        pipeline.release();
        pipeline.release();

        assert!(!pipeline.is_connected());
        assert!(matches!(pipeline.connect(), Err(PipelineError::Released)));
        assert_eq!(sink.count(&SessionEvent::Released), 1);
    }

    #[test]
    fn test_factory_rejects_zero_resolution() {
        let factory = SyntheticPipelineFactory::new(PipelineSettings {
            width: 0,
            ..tiny_settings()
        });
        let identity = DeviceIdentity::new(1, 2, "/dev/bus/usb/001/002");
        let result = factory.create(&identity, Arc::new(RecordingSink::default()));
        assert!(matches!(result, Err(PipelineError::Open(_))));
    }

    #[test]
    fn test_factory_rejects_unaddressable_resolution() {
        let factory = SyntheticPipelineFactory::new(PipelineSettings {
            width: u32::MAX,
            height: u32::MAX,
            ..tiny_settings()
        });
        let identity = DeviceIdentity::new(1, 2, "/dev/bus/usb/001/002");
        let result = factory.create(&identity, Arc::new(RecordingSink::default()));
        assert!(matches!(result, Err(PipelineError::Open(_))));
    }
}
