//! Time-lapse stills taken on a fixed interval, gated by a daily window

pub mod scheduler;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use thiserror::Error;

use crate::camera::CameraError;

pub use scheduler::{FiringOutcome, SchedulerHandle, SnapshotScheduler};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to create snapshot directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("Snapshot task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Daily time-of-day interval during which stills may be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureWindow {
    Always,
    /// Half-open `[start, end)`, wrapping midnight when `start > end`
    Between { start: NaiveTime, end: NaiveTime },
}

impl CaptureWindow {
    /// Equal bounds mean no restriction
    pub fn from_bounds(start: NaiveTime, end: NaiveTime) -> Self {
        if start == end {
            Self::Always
        } else {
            Self::Between { start, end }
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, Self::Always)
    }

    pub fn contains(&self, now: NaiveTime) -> bool {
        match *self {
            Self::Always => true,
            Self::Between { start, end } if start <= end => start <= now && now < end,
            // Over midnight, e.g. 23:30 to 04:15
            Self::Between { start, end } => start <= now || now < end,
        }
    }
}

impl fmt::Display for CaptureWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("always"),
            Self::Between { start, end } => write!(
                f,
                "between {} and {}",
                start.format("%H:%M"),
                end.format("%H:%M")
            ),
        }
    }
}

/// Immutable description of when and where stills are written
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    interval: Duration,
    window: CaptureWindow,
    base: PathBuf,
}

impl SnapshotSchedule {
    pub fn new(interval: Duration, window: CaptureWindow, base: impl Into<PathBuf>) -> Self {
        Self {
            interval,
            window,
            base: base.into(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn window(&self) -> CaptureWindow {
        self.window
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn should_capture(&self, now: NaiveTime) -> bool {
        self.window.contains(now)
    }

    /// `{base}/{YYYY-MM-DD}/image_{HH-MM-SS-ffffff}.jpg`
    pub fn snapshot_path(&self, now: &NaiveDateTime) -> PathBuf {
        self.base
            .join(now.format("%Y-%m-%d").to_string())
            .join(format!("image_{}.jpg", now.format("%H-%M-%S-%6f")))
    }
}
