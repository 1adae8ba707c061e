//! Camera contract shared by the streaming server and the snapshot scheduler

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;
pub mod preset;
pub mod shared;
pub mod test_pattern;

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::utils;

pub use preset::{Mode, Orientation};
pub use shared::SharedCamera;
pub use test_pattern::TestPatternCamera;

/// Macroblocks per frame allowed by H.264 level 4.2
pub const H264_LEVEL_4_2_MAX_MACROBLOCKS: f64 = 8192.0;

/// Byte sink the encoder writes into while recording
pub type RecordingSink = Box<dyn Write + Send>;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Invalid camera settings: {0}")]
    InvalidSettings(String),
    #[error("Camera in use: {0}")]
    Busy(String),
    #[error(
        "{resolution} needs {macroblocks} macroblocks per frame, \
         above the H.264 level 4.2 limit of {limit}"
    )]
    LevelExceeded {
        resolution: Resolution,
        macroblocks: f64,
        limit: f64,
    },
    #[error("Camera backend {0:?} is not available in this build")]
    Unsupported(CameraBackend),
    #[error("A recording is already in progress")]
    AlreadyRecording,
    #[error("Still capture refused while a recording is in progress")]
    RecordingActive,
    #[error("No recording in progress")]
    NotRecording,
    #[error("Recording sink disconnected: {0}")]
    SinkBroken(#[source] io::Error),
    #[error("Recording sink failed: {0}")]
    Sink(#[source] io::Error),
    #[error("Failed to write still image to {}: {source}", path.display())]
    StillWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[cfg(feature = "gstreamer-pipeline")]
    #[error("GStreamer: {0}")]
    Pipeline(String),
}

impl CameraError {
    /// Classify a failed write into the recording sink. A peer that stopped
    /// reading until the write timed out counts as gone.
    pub fn from_sink(err: io::Error) -> Self {
        if utils::is_disconnect(&err) || utils::is_stalled(&err) {
            Self::SinkBroken(err)
        } else {
            Self::Sink(err)
        }
    }

    pub fn is_sink_broken(&self) -> bool {
        matches!(self, Self::SinkBroken(_))
    }
}

/// Hardware camera as seen by the runtime.
///
/// Implementations are not required to guard against misuse across threads;
/// [`SharedCamera`] serializes every call and tracks the recording flag.
pub trait CameraDevice: Send {
    /// Apply resolution, rotation and framerate.
    fn configure(&mut self, settings: &CameraSettings) -> Result<(), CameraError>;

    /// Write one JPEG still to `path` through the still-capture path.
    fn capture_still(&mut self, path: &Path) -> Result<(), CameraError>;

    /// Begin encoding continuously into `sink`.
    fn start_recording(
        &mut self,
        sink: RecordingSink,
        request: &RecordingRequest,
    ) -> Result<(), CameraError>;

    /// Pump the encoder into the sink for up to `timeout`.
    ///
    /// Returns early with [`CameraError::SinkBroken`] once the sink stops
    /// accepting writes.
    fn wait_recording(&mut self, timeout: Duration) -> Result<(), CameraError>;

    /// Stop encoding and hand the sink back so the caller can close it.
    ///
    /// Returns `Ok(None)` when the sink already failed.
    fn stop_recording(&mut self) -> Result<Option<RecordingSink>, CameraError>;
}

/// Which camera implementation to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CameraBackend {
    Gstreamer,
    TestPattern,
}

impl Default for CameraBackend {
    fn default() -> Self {
        if cfg!(feature = "gstreamer-pipeline") {
            Self::Gstreamer
        } else {
            Self::TestPattern
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale both sides, truncating towards zero
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            width: (self.width as f64 * factor) as u32,
            height: (self.height as f64 * factor) as u32,
        }
    }

    pub fn swapped(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    /// 16x16 macroblocks per frame, using real division as the level tables do
    pub fn macroblocks(self) -> f64 {
        (self.width as f64 / 16.0) * (self.height as f64 / 16.0)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Sensor rotation in clockwise degrees
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }

    /// Quarter turns swap the output width and height
    pub fn is_quarter_turn(self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270)
    }
}

impl TryFrom<u16> for Rotation {
    type Error = CameraError;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Self::None),
            90 => Ok(Self::Cw90),
            180 => Ok(Self::Cw180),
            270 => Ok(Self::Cw270),
            other => Err(CameraError::InvalidSettings(format!(
                "rotation must be 0, 90, 180 or 270 degrees, got {other}"
            ))),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// Resolved camera properties applied once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub still: Resolution,
    pub video: Resolution,
    pub rotation: Rotation,
    pub framerate: f64,
}

impl CameraSettings {
    pub fn validate(&self) -> Result<(), CameraError> {
        for (name, res) in [("still", self.still), ("video", self.video)] {
            if res.width == 0 || res.height == 0 {
                return Err(CameraError::InvalidSettings(format!(
                    "{name} resolution {res} has a zero dimension"
                )));
            }
        }
        if !self.framerate.is_finite() || self.framerate <= 0.0 {
            return Err(CameraError::InvalidSettings(format!(
                "framerate must be positive, got {}",
                self.framerate
            )));
        }
        Ok(())
    }
}

/// Reject video sizes the level 4.2 encoder cannot produce
pub fn check_h264_level(video: Resolution) -> Result<(), CameraError> {
    let macroblocks = video.macroblocks();
    if macroblocks > H264_LEVEL_4_2_MAX_MACROBLOCKS {
        return Err(CameraError::LevelExceeded {
            resolution: video,
            macroblocks,
            limit: H264_LEVEL_4_2_MAX_MACROBLOCKS,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    H264,
}

/// Parameters for one continuous recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRequest {
    pub format: VideoFormat,
    pub level: String,
    pub resize: Resolution,
}

impl RecordingRequest {
    pub fn h264(resize: Resolution) -> Self {
        Self {
            format: VideoFormat::H264,
            level: "4.2".into(),
            resize,
        }
    }
}

/// Open the configured backend, let the sensor settle and apply `settings`
pub fn open(
    backend: CameraBackend,
    source: &str,
    settings: &CameraSettings,
    settle: Duration,
) -> Result<SharedCamera, CameraError> {
    settings.validate()?;

    debug!(?backend, source, "Making camera object");
    let mut device: Box<dyn CameraDevice> = match backend {
        #[cfg(feature = "gstreamer-pipeline")]
        CameraBackend::Gstreamer => Box::new(gst::GstCamera::new(source)?),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        CameraBackend::Gstreamer => return Err(CameraError::Unsupported(backend)),
        CameraBackend::TestPattern => {
            warn!("Using the synthetic test-pattern camera, no hardware will be touched");
            Box::new(TestPatternCamera::new())
        }
    };

    device.configure(settings)?;

    if !settle.is_zero() {
        debug!(?settle, "Letting the camera warm up");
        std::thread::sleep(settle);
    }

    info!(
        still = %settings.still,
        video = %settings.video,
        rotation = settings.rotation.degrees(),
        framerate = settings.framerate,
        "Camera ready"
    );
    Ok(SharedCamera::new(device, settings.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_check_accepts_full_mode_resolution() {
        let video = Resolution::new(1640, 1232);
        assert!((video.macroblocks() - 7892.5).abs() < f64::EPSILON);
        assert!(check_h264_level(video).is_ok());
    }

    #[test]
    fn level_check_rejects_full_sensor_resolution() {
        let err = check_h264_level(Resolution::new(3280, 2464)).unwrap_err();
        assert!(matches!(err, CameraError::LevelExceeded { .. }));
    }

    #[test]
    fn rotation_only_accepts_right_angles() {
        assert_eq!(Rotation::try_from(270).unwrap(), Rotation::Cw270);
        assert!(Rotation::try_from(45).is_err());
        assert_eq!(u16::from(Rotation::Cw180), 180);
    }

    #[test]
    fn scaled_resolution_truncates() {
        assert_eq!(
            Resolution::new(1640, 1232).scaled(1.5),
            Resolution::new(2460, 1848)
        );
        assert_eq!(Resolution::new(3, 3).scaled(0.5), Resolution::new(1, 1));
    }

    #[test]
    fn settings_reject_zero_framerate() {
        let settings = CameraSettings {
            still: Resolution::new(640, 480),
            video: Resolution::new(640, 480),
            rotation: Rotation::None,
            framerate: 0.0,
        };
        assert!(matches!(
            settings.validate(),
            Err(CameraError::InvalidSettings(_))
        ));
    }

    #[test]
    fn sink_errors_are_classified_by_kind() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(CameraError::from_sink(reset).is_sink_broken());

        let stalled = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(CameraError::from_sink(stalled).is_sink_broken());

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(!CameraError::from_sink(denied).is_sink_broken());
    }

    #[test]
    fn opening_without_gstreamer_support_is_rejected() {
        if cfg!(feature = "gstreamer-pipeline") {
            return;
        }
        let settings = CameraSettings {
            still: Resolution::new(640, 480),
            video: Resolution::new(640, 480),
            rotation: Rotation::None,
            framerate: 30.0,
        };
        let err = open(CameraBackend::Gstreamer, "", &settings, Duration::ZERO).unwrap_err();
        assert!(matches!(err, CameraError::Unsupported(CameraBackend::Gstreamer)));
    }
}
