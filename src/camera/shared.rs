//! Mutual exclusion around camera state transitions

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use super::{CameraDevice, CameraError, CameraSettings, RecordingRequest, RecordingSink};


/// The single camera, shared between the streaming server and the snapshot
/// scheduler.
///
/// Every operation takes the same lock, so a still capture can never overlap
/// a recording start, pump or stop. Stills are refused outright while a
/// recording is active rather than queued behind it.
///
/// The recording flag is only written with the lock held but can be read
/// without it, so a refused still never waits on a pump in progress.
#[derive(Clone)]
pub struct SharedCamera {
    device: Arc<Mutex<Box<dyn CameraDevice>>>,
    recording: Arc<AtomicBool>,
    settings: Arc<CameraSettings>,
}

impl std::fmt::Debug for SharedCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCamera")
            .field("recording", &self.is_recording())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SharedCamera {
    pub fn new(device: Box<dyn CameraDevice>, settings: CameraSettings) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            recording: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn CameraDevice>> {
        // A panicking holder cannot leave the flag half-written
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn capture_still(&self, path: &Path) -> Result<(), CameraError> {
        if self.is_recording() {
            return Err(CameraError::RecordingActive);
        }
        let mut device = self.lock();
        // A recording may have started while we waited for the lock
        if self.is_recording() {
            return Err(CameraError::RecordingActive);
        }
        device.capture_still(path)
    }

    pub fn start_recording(
        &self,
        sink: RecordingSink,
        request: &RecordingRequest,
    ) -> Result<(), CameraError> {
        let mut device = self.lock();
        if self.is_recording() {
            return Err(CameraError::AlreadyRecording);
        }
        device.start_recording(sink, request)?;
        self.recording.store(true, Ordering::Release);
        Ok(())
    }

    pub fn wait_recording(&self, timeout: Duration) -> Result<(), CameraError> {
        let mut device = self.lock();
        if !self.is_recording() {
            return Err(CameraError::NotRecording);
        }
        device.wait_recording(timeout)
    }

    /// Always safe to call. The recording flag is cleared whatever the device
    /// reports, and a sink that already broke is not an error.
    pub fn stop_recording(&self) -> Result<Option<RecordingSink>, CameraError> {
        let mut device = self.lock();
        if !self.is_recording() {
            return Ok(None);
        }
        self.recording.store(false, Ordering::Release);
        match device.stop_recording() {
            Err(CameraError::SinkBroken(err)) => {
                debug!(error = %err, "Sink already gone when stopping recording");
                Ok(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};

    use super::*;
    use crate::camera::{Resolution, Rotation, TestPatternCamera};

    struct ResetSink;

    impl Write for ResetSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::ConnectionReset.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::ErrorKind::ConnectionReset.into())
        }
    }

    /// Blocks every write, like a peer whose receive window is full
    struct StalledSink(Duration);

    impl Write for StalledSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            std::thread::sleep(self.0);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn camera() -> SharedCamera {
        let settings = CameraSettings {
            still: Resolution::new(64, 48),
            video: Resolution::new(64, 48),
            rotation: Rotation::None,
            framerate: 50.0,
        };
        let mut device = TestPatternCamera::new();
        device.configure(&settings).unwrap();
        SharedCamera::new(Box::new(device), settings)
    }

    fn request() -> RecordingRequest {
        RecordingRequest::h264(Resolution::new(64, 48))
    }

    #[test]
    fn still_is_refused_while_recording() {
        let camera = camera();
        let dir = tempfile::tempdir().unwrap();
        camera.start_recording(Box::new(io::sink()), &request()).unwrap();

        let err = camera.capture_still(&dir.path().join("still.jpg")).unwrap_err();
        assert!(matches!(err, CameraError::RecordingActive));
        assert!(!dir.path().join("still.jpg").exists());
    }

    #[test]
    fn still_is_refused_without_waiting_on_a_stalled_pump() {
        let camera = camera();
        camera
            .start_recording(Box::new(StalledSink(Duration::from_secs(2))), &request())
            .unwrap();

        let pumping = camera.clone();
        let pump = std::thread::spawn(move || pumping.wait_recording(Duration::from_secs(1)));
        std::thread::sleep(Duration::from_millis(100));

        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = camera.capture_still(&dir.path().join("still.jpg")).unwrap_err();
        assert!(matches!(err, CameraError::RecordingActive));
        assert!(started.elapsed() < Duration::from_millis(500));

        pump.join().unwrap().unwrap();
    }

    #[test]
    fn second_recording_is_rejected() {
        let camera = camera();
        camera.start_recording(Box::new(io::sink()), &request()).unwrap();
        let err = camera
            .start_recording(Box::new(io::sink()), &request())
            .unwrap_err();
        assert!(matches!(err, CameraError::AlreadyRecording));
    }

    #[test]
    fn stop_after_broken_sink_clears_flag() {
        let camera = camera();
        camera.start_recording(Box::new(ResetSink), &request()).unwrap();

        let err = camera.wait_recording(Duration::from_millis(100)).unwrap_err();
        assert!(err.is_sink_broken());

        assert!(camera.stop_recording().unwrap().is_none());
        assert!(!camera.is_recording());

        let dir = tempfile::tempdir().unwrap();
        camera.capture_still(&dir.path().join("after.jpg")).unwrap();
    }

    #[test]
    fn stop_without_recording_is_a_no_op() {
        let camera = camera();
        assert!(camera.stop_recording().unwrap().is_none());
    }

    #[test]
    fn wait_without_recording_is_rejected() {
        let camera = camera();
        assert!(matches!(
            camera.wait_recording(Duration::from_millis(10)),
            Err(CameraError::NotRecording)
        ));
    }
}
