//! Synthetic camera for development machines and the test suite

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use tracing::{debug, instrument};

use super::{
    CameraDevice, CameraError, CameraSettings, RecordingRequest, RecordingSink, Resolution,
};

/// H.264 Annex-B access unit delimiter, a valid stream with no picture data
const ACCESS_UNIT_DELIMITER: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

const JPEG_QUALITY: u8 = 85;

struct Recording {
    sink: RecordingSink,
    frame_interval: Duration,
    next_frame: Instant,
    frames: u64,
}

/// Camera that renders a gradient test card for stills and emits one
/// access unit delimiter per frame while recording
#[derive(Default)]
pub struct TestPatternCamera {
    settings: Option<CameraSettings>,
    recording: Option<Recording>,
}

impl TestPatternCamera {
    pub fn new() -> Self {
        Self::default()
    }

    fn settings(&self) -> Result<&CameraSettings, CameraError> {
        self.settings
            .as_ref()
            .ok_or_else(|| CameraError::InvalidSettings("camera has not been configured".into()))
    }

    fn render(size: Resolution) -> RgbImage {
        RgbImage::from_fn(size.width, size.height, |x, y| {
            let r = (x * 255 / size.width.max(1)) as u8;
            let g = (y * 255 / size.height.max(1)) as u8;
            Rgb([r, g, 128])
        })
    }
}

impl CameraDevice for TestPatternCamera {
    fn configure(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
        settings.validate()?;
        self.settings = Some(settings.clone());
        Ok(())
    }

    #[instrument(skip(self))]
    fn capture_still(&mut self, path: &Path) -> Result<(), CameraError> {
        let settings = self.settings()?;
        let size = if settings.rotation.is_quarter_turn() {
            settings.still.swapped()
        } else {
            settings.still
        };

        let write_err = |source| CameraError::StillWrite {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
            .encode_image(&Self::render(size))?;
        writer.flush().map_err(write_err)?;
        Ok(())
    }

    fn start_recording(
        &mut self,
        sink: RecordingSink,
        request: &RecordingRequest,
    ) -> Result<(), CameraError> {
        if self.recording.is_some() {
            return Err(CameraError::AlreadyRecording);
        }
        let framerate = self.settings()?.framerate;
        debug!(resize = %request.resize, level = %request.level, "Test pattern recording started");

        self.recording = Some(Recording {
            sink,
            frame_interval: Duration::from_secs_f64(1.0 / framerate),
            next_frame: Instant::now(),
            frames: 0,
        });
        Ok(())
    }

    fn wait_recording(&mut self, timeout: Duration) -> Result<(), CameraError> {
        let recording = self.recording.as_mut().ok_or(CameraError::NotRecording)?;
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            if recording.next_frame > deadline {
                thread::sleep(deadline.saturating_duration_since(now));
                return Ok(());
            }
            thread::sleep(recording.next_frame.saturating_duration_since(now));

            recording
                .sink
                .write_all(&ACCESS_UNIT_DELIMITER)
                .map_err(CameraError::from_sink)?;
            recording.frames += 1;
            recording.next_frame += recording.frame_interval;
        }
    }

    fn stop_recording(&mut self) -> Result<Option<RecordingSink>, CameraError> {
        let Some(mut recording) = self.recording.take() else {
            return Ok(None);
        };
        debug!(frames = recording.frames, "Test pattern recording stopped");

        match recording.sink.flush() {
            Ok(()) => Ok(Some(recording.sink)),
            Err(err) => match CameraError::from_sink(err) {
                CameraError::SinkBroken(_) => Ok(None),
                other => Err(other),
            },
        }
    }
}
