pub mod camera;
pub mod cli;
pub mod server;
pub mod snapshot;
pub mod supervisor;
pub mod utils;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use camera::{CameraBackend, CameraError, CameraSettings, Mode, Orientation, Resolution, Rotation};
use snapshot::{CaptureWindow, SnapshotSchedule};

pub use supervisor::Supervisor;

/// Shortest snapshot interval the scheduler accepts
pub const MIN_SNAPSHOT_INTERVAL_SECS: u64 = 10;

/// Still resolution scaling relative to the video resolution
pub const SCALING_RANGE: std::ops::RangeInclusive<f64> = 0.25..=3.0;

/// Prefix for environment overrides, e.g. `RPICAM__SERVER__PORT=5000`
pub const ENV_PREFIX: &str = "RPICAM";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Snapshot interval of {secs}s is below the {min}s minimum")]
    IntervalTooShort { secs: u64, min: u64 },
    #[error("{hour:02}:{minute:02} is not a valid time of day")]
    InvalidTime { hour: u32, minute: u32 },
    #[error("Snapshot scaling {0} is outside 0.25..=3.0")]
    ScalingOutOfRange(f64),
    #[error("Server port must be non-zero")]
    ZeroPort,
    #[error("Stall timeout must be at least one second")]
    ZeroStallTimeout,
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub camera: CameraConfig,
    pub snapshot: SnapshotConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Exit the process on an unexpected streaming error instead of
    /// returning to accept
    pub fatal_session_errors: bool,
    /// Drop a client that has not accepted any video for this long
    pub stall_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub backend: CameraBackend,
    /// GStreamer source element description
    pub source: String,
    pub mode: Mode,
    pub orientation: Orientation,
    pub rotation: Rotation,
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    pub scaling: f64,
    /// Sensor warm-up after opening
    pub settle_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// `[hour, minute]`; equal to `stop` means always capture
    pub start: [u32; 2],
    pub stop: [u32; 2],
    pub base: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 50007,
            fatal_session_errors: true,
            stall_timeout_secs: 10,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::default(),
            source: "v4l2src device=/dev/video0".into(),
            mode: Mode::Full,
            orientation: Orientation::Landscape,
            rotation: Rotation::None,
            width: 1640,
            height: 1232,
            framerate: 30.0,
            scaling: 1.0,
            settle_secs: 2.0,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 120,
            start: [0, 0],
            stop: [0, 0],
            base: PathBuf::from("~/rpicam/images"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { debug: true }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `RPICAM__*` environment
    /// variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Everything that must hold before the camera is opened
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.server.stall_timeout_secs == 0 {
            return Err(ConfigError::ZeroStallTimeout);
        }
        if !SCALING_RANGE.contains(&self.camera.scaling) {
            return Err(ConfigError::ScalingOutOfRange(self.camera.scaling));
        }

        let settings = self.camera.settings();
        settings.validate()?;
        camera::check_h264_level(settings.video)?;

        if self.snapshot.enabled {
            self.snapshot.schedule()?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }
}

impl ServerConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

impl CameraConfig {
    /// Apply the mode preset and orientation to get the sensor settings
    pub fn settings(&self) -> CameraSettings {
        let (video, framerate, scaling) = match self.mode.preset() {
            Some(preset) => (preset.video, preset.framerate, preset.scaling),
            None => (
                Resolution::new(self.width, self.height),
                self.framerate,
                self.scaling,
            ),
        };
        let video = self.orientation.apply(video);

        CameraSettings {
            still: video.scaled(scaling),
            video,
            rotation: self.rotation,
            framerate,
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs_f64(self.settle_secs.max(0.0))
    }
}

fn time_of_day([hour, minute]: [u32; 2]) -> Result<NaiveTime, ConfigError> {
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or(ConfigError::InvalidTime { hour, minute })
}

impl SnapshotConfig {
    pub fn window(&self) -> Result<CaptureWindow, ConfigError> {
        Ok(CaptureWindow::from_bounds(
            time_of_day(self.start)?,
            time_of_day(self.stop)?,
        ))
    }

    pub fn schedule(&self) -> Result<SnapshotSchedule, ConfigError> {
        if self.interval_secs < MIN_SNAPSHOT_INTERVAL_SECS {
            return Err(ConfigError::IntervalTooShort {
                secs: self.interval_secs,
                min: MIN_SNAPSHOT_INTERVAL_SECS,
            });
        }
        Ok(SnapshotSchedule::new(
            Duration::from_secs(self.interval_secs),
            self.window()?,
            utils::expand_home(&self.base),
        ))
    }
}
