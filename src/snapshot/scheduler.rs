//! Repeating snapshot timer running beside the streaming server

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{SnapshotError, SnapshotSchedule};
use crate::camera::{CameraError, SharedCamera};

/// What a single timer firing did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiringOutcome {
    Captured(PathBuf),
    OutsideWindow,
}

/// Takes stills on a fixed interval.
///
/// The timer re-arms only once a firing has returned, so a slow capture
/// pushes every later firing back by the same amount.
pub struct SnapshotScheduler {
    schedule: Arc<SnapshotSchedule>,
    camera: SharedCamera,
}

impl SnapshotScheduler {
    pub fn new(schedule: SnapshotSchedule, camera: SharedCamera) -> Self {
        Self {
            schedule: Arc::new(schedule),
            camera,
        }
    }

    /// Arm the timer on a background task, cancelled with `shutdown` or the
    /// returned handle
    pub fn start(self, shutdown: &CancellationToken) -> SchedulerHandle {
        let token = shutdown.child_token();

        info!(
            resolution = %self.camera.settings().still,
            interval = ?self.schedule.interval(),
            window = %self.schedule.window(),
            base = %self.schedule.base().display(),
            "Snapshot scheduler started"
        );

        let task = tokio::spawn(self.run(token.clone()));
        SchedulerHandle { token, task }
    }

    async fn run(self, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.schedule.interval()) => {}
            }

            // An in-flight firing is not cancelled, only the next one
            match self.fire(Local::now().naive_local()).await {
                Ok(FiringOutcome::Captured(path)) => {
                    debug!(path = %path.display(), "Snapshot taken")
                }
                Ok(FiringOutcome::OutsideWindow) => trace!("Outside capture window"),
                Err(SnapshotError::Camera(CameraError::RecordingActive)) => {
                    debug!("Client is streaming, snapshot skipped")
                }
                Err(e) => warn!(error = %e, "Snapshot failed"),
            }
        }
        debug!("Snapshot scheduler stopped");
    }

    /// One unit of scheduler work at wall-clock time `now`
    pub async fn fire(&self, now: NaiveDateTime) -> Result<FiringOutcome, SnapshotError> {
        if !self.schedule.should_capture(now.time()) {
            return Ok(FiringOutcome::OutsideWindow);
        }

        let path = self.schedule.snapshot_path(&now);
        let camera = self.camera.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || capture_to(&camera, &target)).await??;

        Ok(FiringOutcome::Captured(path))
    }
}

fn capture_to(camera: &SharedCamera, path: &Path) -> Result<(), SnapshotError> {
    if let Some(dir) = path.parent() {
        // create_dir_all tolerates a concurrent creator
        fs::create_dir_all(dir).map_err(|source| SnapshotError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    camera.capture_still(path)?;
    Ok(())
}

/// A running scheduler
pub struct SchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Cancel future firings; one already in progress still completes
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop and wait for the timer task to wind down
    pub async fn join(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Snapshot scheduler task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use chrono::{NaiveDate, NaiveTime};

    use super::*;
    use crate::camera::{
        CameraDevice, CameraSettings, RecordingRequest, Resolution, Rotation, TestPatternCamera,
    };
    use crate::snapshot::CaptureWindow;

    fn camera() -> SharedCamera {
        let settings = CameraSettings {
            still: Resolution::new(32, 24),
            video: Resolution::new(32, 24),
            rotation: Rotation::None,
            framerate: 30.0,
        };
        let mut device = TestPatternCamera::new();
        device.configure(&settings).unwrap();
        SharedCamera::new(Box::new(device), settings)
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_micro_opt(hour, minute, 0, 123_456)
            .unwrap()
    }

    fn window(start: (u32, u32), end: (u32, u32)) -> CaptureWindow {
        CaptureWindow::from_bounds(
            NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn firing_inside_window_writes_dated_still() {
        let dir = tempfile::tempdir().unwrap();
        let schedule = SnapshotSchedule::new(
            Duration::from_secs(10),
            window((6, 0), (20, 0)),
            dir.path(),
        );
        let scheduler = SnapshotScheduler::new(schedule, camera());

        let outcome = scheduler.fire(at(12, 0)).await.unwrap();
        let expected = dir.path().join("2024-06-01").join("image_12-00-00-123456.jpg");
        assert_eq!(outcome, FiringOutcome::Captured(expected.clone()));
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn firing_outside_window_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let schedule = SnapshotSchedule::new(
            Duration::from_secs(10),
            window((6, 0), (20, 0)),
            dir.path(),
        );
        let scheduler = SnapshotScheduler::new(schedule, camera());

        assert_eq!(scheduler.fire(at(21, 0)).await.unwrap(), FiringOutcome::OutsideWindow);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn firing_during_recording_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let camera = camera();
        camera
            .start_recording(Box::new(io::sink()), &RecordingRequest::h264(Resolution::new(32, 24)))
            .unwrap();
        let schedule = SnapshotSchedule::new(
            Duration::from_secs(10),
            CaptureWindow::Always,
            dir.path(),
        );
        let scheduler = SnapshotScheduler::new(schedule, camera);

        let err = scheduler.fire(at(3, 0)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Camera(CameraError::RecordingActive)));
    }

    #[tokio::test]
    async fn unwritable_base_reports_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a directory").unwrap();
        let schedule = SnapshotSchedule::new(
            Duration::from_secs(10),
            CaptureWindow::Always,
            &blocker,
        );
        let scheduler = SnapshotScheduler::new(schedule, camera());

        let err = scheduler.fire(at(3, 0)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::CreateDir { .. }));
    }

    #[tokio::test]
    async fn stop_ends_the_timer_task() {
        let dir = tempfile::tempdir().unwrap();
        let schedule = SnapshotSchedule::new(
            Duration::from_secs(3600),
            CaptureWindow::Always,
            dir.path(),
        );
        let shutdown = CancellationToken::new();
        let handle = SnapshotScheduler::new(schedule, camera()).start(&shutdown);
        assert!(handle.is_running());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .unwrap();
    }
}
