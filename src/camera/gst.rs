//! GStreamer-backed camera with hardware H.264 encoding where available

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, instrument, warn};

use super::{
    CameraDevice, CameraError, CameraSettings, RecordingRequest, RecordingSink, Rotation,
};

/// Upper bound on a single appsink pull so deadlines are honoured
const PULL_SLICE: Duration = Duration::from_millis(100);

/// H.264 encoders in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoder {
    V4l2,
    X264,
    OpenH264,
}

impl Encoder {
    fn detect() -> Result<Self, CameraError> {
        let candidates = [
            ("v4l2h264enc", Self::V4l2),   // Pi hardware encoder
            ("x264enc", Self::X264),       // Software, best quality
            ("openh264enc", Self::OpenH264), // Software fallback
        ];

        for (name, encoder) in candidates {
            if let Some(factory) = gst::ElementFactory::find(name) {
                debug!(
                    "Found encoder: {} - {}",
                    name,
                    factory.metadata("long-name").unwrap_or("")
                );
                return Ok(encoder);
            }
        }

        Err(CameraError::Pipeline("No H.264 encoder element available".into()))
    }

    fn description(self, level: &str) -> String {
        match self {
            Self::V4l2 => {
                let level = v4l2_level(level).unwrap_or(V4L2_LEVEL_4_2);
                format!(
                    "v4l2h264enc extra-controls=\"controls,h264_level={level},\
                     repeat_sequence_header=1\""
                )
            }
            Self::X264 => format!(
                "x264enc tune=zerolatency speed-preset=ultrafast option-string=\"level={}\"",
                level
            ),
            Self::OpenH264 => "openh264enc".to_string(),
        }
    }
}

const V4L2_LEVEL_4_2: u32 = 13;

/// V4L2_MPEG_VIDEO_H264_LEVEL_* control values
fn v4l2_level(level: &str) -> Option<u32> {
    match level {
        "4" | "4.0" => Some(11),
        "4.1" => Some(12),
        "4.2" => Some(V4L2_LEVEL_4_2),
        _ => None,
    }
}

fn flip_method(rotation: Rotation) -> &'static str {
    match rotation {
        Rotation::None => "none",
        Rotation::Cw90 => "clockwise",
        Rotation::Cw180 => "rotate-180",
        Rotation::Cw270 => "counterclockwise",
    }
}

/// Framerate as a GStreamer fraction with millihertz precision
fn framerate_fraction(fps: f64) -> (i64, i64) {
    ((fps * 1000.0).round() as i64, 1000)
}

/// Map a bus error into the camera taxonomy
fn bus_error(err: &gst::message::Error) -> CameraError {
    let glib_err = err.error();
    let message = format!(
        "{} ({})",
        glib_err,
        err.debug().map(|d| d.to_string()).unwrap_or_default()
    );

    if glib_err.matches(gst::ResourceError::Busy) {
        CameraError::Busy(message)
    } else if glib_err.matches(gst::CoreError::Negotiation)
        || glib_err.matches(gst::StreamError::Format)
    {
        CameraError::InvalidSettings(message)
    } else {
        CameraError::Pipeline(message)
    }
}

fn launch(description: &str) -> Result<gst::Pipeline, CameraError> {
    debug!("Pipeline: {}", description);
    gst::parse::launch(description)
        .map_err(|e| CameraError::Pipeline(format!("Failed to parse pipeline: {}", e)))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| CameraError::Pipeline("Failed to create pipeline".into()))
}

/// Run a finite pipeline until EOS, always returning it to Null
fn run_to_completion(pipeline: &gst::Pipeline) -> Result<(), CameraError> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| CameraError::Pipeline("Pipeline has no bus".into()))?;

    let result = match pipeline.set_state(gst::State::Playing) {
        Ok(_) => {
            match bus.timed_pop_filtered(
                gst::ClockTime::NONE,
                &[gst::MessageType::Eos, gst::MessageType::Error],
            ) {
                Some(msg) => match msg.view() {
                    gst::MessageView::Error(err) => Err(bus_error(err)),
                    _ => Ok(()),
                },
                None => Err(CameraError::Pipeline("Bus closed before EOS".into())),
            }
        }
        // The element that refused the state change posts the reason on the bus
        Err(_) => Err(bus
            .pop_filtered(&[gst::MessageType::Error])
            .and_then(|msg| match msg.view() {
                gst::MessageView::Error(err) => Some(bus_error(err)),
                _ => None,
            })
            .unwrap_or_else(|| CameraError::Pipeline("Failed to start pipeline".into()))),
    };

    let _ = pipeline.set_state(gst::State::Null);
    result
}

struct Recording {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    sink: RecordingSink,
}

/// Camera driven through GStreamer pipelines built from a configurable source
/// element, e.g. `libcamerasrc` or `v4l2src device=/dev/video0`
pub struct GstCamera {
    source: String,
    encoder: Encoder,
    settings: Option<CameraSettings>,
    recording: Option<Recording>,
}

impl GstCamera {
    pub fn new(source: &str) -> Result<Self, CameraError> {
        gst::init().map_err(|e| {
            CameraError::Pipeline(format!("Failed to initialize GStreamer: {}", e))
        })?;

        let encoder = Encoder::detect()?;
        info!(source, ?encoder, "Initializing GStreamer camera");

        Ok(Self {
            source: source.to_string(),
            encoder,
            settings: None,
            recording: None,
        })
    }

    fn settings(&self) -> Result<&CameraSettings, CameraError> {
        self.settings
            .as_ref()
            .ok_or_else(|| CameraError::InvalidSettings("camera has not been configured".into()))
    }

    fn still_pipeline(&self, settings: &CameraSettings, path: &Path) -> String {
        format!(
            "{} num-buffers=1 ! \
             videoconvert ! \
             videoflip method={} ! \
             videoscale ! \
             video/x-raw,width={},height={} ! \
             jpegenc ! \
             filesink location=\"{}\"",
            self.source,
            flip_method(settings.rotation),
            settings.still.width,
            settings.still.height,
            path.display()
        )
    }

    fn recording_pipeline(&self, settings: &CameraSettings, request: &RecordingRequest) -> String {
        let (fps_n, fps_d) = framerate_fraction(settings.framerate);
        format!(
            "{} ! \
             video/x-raw,width={},height={},framerate={}/{} ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
             videoconvert ! \
             videoflip method={} ! \
             videoscale ! \
             video/x-raw,width={},height={} ! \
             {} ! \
             h264parse config-interval=-1 ! \
             video/x-h264,stream-format=byte-stream,alignment=au ! \
             appsink name=appsink",
            self.source,
            settings.video.width,
            settings.video.height,
            fps_n,
            fps_d,
            flip_method(settings.rotation),
            request.resize.width,
            request.resize.height,
            self.encoder.description(&request.level),
        )
    }

    /// Surface the first pending error posted on the recording bus
    fn pending_error(pipeline: &gst::Pipeline) -> Option<CameraError> {
        let bus = pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(bus_error(err)),
            _ => None,
        }
    }
}

impl CameraDevice for GstCamera {
    /// Probe the source once so rejected settings or a busy device fail at
    /// startup rather than on the first client
    fn configure(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
        settings.validate()?;

        let (fps_n, fps_d) = framerate_fraction(settings.framerate);
        let probe = launch(&format!(
            "{} num-buffers=1 ! video/x-raw,width={},height={},framerate={}/{} ! fakesink",
            self.source, settings.video.width, settings.video.height, fps_n, fps_d
        ))?;
        run_to_completion(&probe)?;

        self.settings = Some(settings.clone());
        Ok(())
    }

    #[instrument(skip(self))]
    fn capture_still(&mut self, path: &Path) -> Result<(), CameraError> {
        let settings = self.settings()?;
        let pipeline = launch(&self.still_pipeline(settings, path))?;
        run_to_completion(&pipeline)
    }

    fn start_recording(
        &mut self,
        sink: RecordingSink,
        request: &RecordingRequest,
    ) -> Result<(), CameraError> {
        if self.recording.is_some() {
            return Err(CameraError::AlreadyRecording);
        }
        let settings = self.settings()?;
        let pipeline = launch(&self.recording_pipeline(settings, request))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| CameraError::Pipeline("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CameraError::Pipeline("Failed to cast to AppSink".into()))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 30u32);
        appsink.set_property("drop", false); // Every access unit must reach the client
        appsink.set_property("sync", false);

        if pipeline.set_state(gst::State::Playing).is_err() {
            let err = Self::pending_error(&pipeline)
                .unwrap_or_else(|| CameraError::Pipeline("Failed to start pipeline".into()));
            let _ = pipeline.set_state(gst::State::Null);
            return Err(err);
        }

        info!(resize = %request.resize, level = %request.level, "Recording started");
        self.recording = Some(Recording {
            pipeline,
            appsink,
            sink,
        });
        Ok(())
    }

    fn wait_recording(&mut self, timeout: Duration) -> Result<(), CameraError> {
        let recording = self.recording.as_mut().ok_or(CameraError::NotRecording)?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }

            if let Some(err) = Self::pending_error(&recording.pipeline) {
                return Err(err);
            }

            let slice = gst::ClockTime::from_nseconds(remaining.min(PULL_SLICE).as_nanos() as u64);
            let Some(sample) = recording.appsink.try_pull_sample(slice) else {
                if recording.appsink.is_eos() {
                    return Err(CameraError::Pipeline("Camera stream ended".into()));
                }
                continue;
            };

            let buffer = sample
                .buffer()
                .ok_or_else(|| CameraError::Pipeline("Sample contains no buffer".into()))?;
            let map = buffer
                .map_readable()
                .map_err(|_| CameraError::Pipeline("Failed to map buffer".into()))?;

            recording
                .sink
                .write_all(map.as_slice())
                .map_err(CameraError::from_sink)?;
        }
    }

    fn stop_recording(&mut self) -> Result<Option<RecordingSink>, CameraError> {
        let Some(mut recording) = self.recording.take() else {
            return Ok(None);
        };
        info!("Stopping recording");

        recording
            .pipeline
            .set_state(gst::State::Null)
            .map_err(|e| CameraError::Pipeline(format!("Failed to stop pipeline: {:?}", e)))?;

        match recording.sink.flush() {
            Ok(()) => Ok(Some(recording.sink)),
            Err(err) => match CameraError::from_sink(err) {
                CameraError::SinkBroken(_) => Ok(None),
                other => Err(other),
            },
        }
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        if let Some(recording) = self.recording.take() {
            if let Err(e) = recording.pipeline.set_state(gst::State::Null) {
                warn!("Failed to release camera pipeline: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_maps_to_v4l2_control() {
        assert_eq!(v4l2_level("4.2"), Some(13));
        assert_eq!(v4l2_level("5.1"), None);
    }

    #[test]
    fn fractional_framerates_survive() {
        assert_eq!(framerate_fraction(29.97), (29970, 1000));
        assert_eq!(framerate_fraction(30.0), (30000, 1000));
    }

    #[test]
    fn x264_carries_the_requested_level() {
        assert!(Encoder::X264.description("4.2").contains("level=4.2"));
    }
}
