use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rpicam::camera::{self, CameraBackend, CameraSettings, Resolution, Rotation, SharedCamera};
use rpicam::server::StreamingServer;
use rpicam::snapshot::{CaptureWindow, SnapshotSchedule, SnapshotScheduler};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn test_camera() -> SharedCamera {
    let settings = CameraSettings {
        still: Resolution::new(48, 32),
        video: Resolution::new(48, 32),
        rotation: Rotation::None,
        framerate: 50.0,
    };
    camera::open(CameraBackend::TestPattern, "", &settings, Duration::ZERO).unwrap()
}

/// Every snapshot under `base`, checking the `{date}/image_*.jpg` layout
fn snapshots(base: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(days) = fs::read_dir(base) else {
        return found;
    };
    for day in days {
        let day = day.unwrap().path();
        let name = day.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name.len(), "YYYY-MM-DD".len(), "unexpected directory {name}");
        for image in fs::read_dir(&day).unwrap() {
            let image = image.unwrap().path();
            let file = image.file_name().unwrap().to_string_lossy().into_owned();
            assert!(file.starts_with("image_") && file.ends_with(".jpg"), "unexpected file {file}");
            found.push(image);
        }
    }
    found
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn continuous_schedule_fires_every_interval() {
    let dir = tempfile::tempdir().unwrap();
    let schedule = SnapshotSchedule::new(
        Duration::from_millis(250),
        CaptureWindow::Always,
        dir.path(),
    );
    let shutdown = CancellationToken::new();
    let handle = SnapshotScheduler::new(schedule, test_camera()).start(&shutdown);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    handle.join().await;

    let taken = snapshots(dir.path());
    assert!(
        (2..=5).contains(&taken.len()),
        "expected about four snapshots, found {}",
        taken.len()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_scheduler_takes_no_more_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let schedule = SnapshotSchedule::new(
        Duration::from_millis(100),
        CaptureWindow::Always,
        dir.path(),
    );
    let shutdown = CancellationToken::new();
    let handle = SnapshotScheduler::new(schedule, test_camera()).start(&shutdown);

    tokio::time::sleep(Duration::from_millis(350)).await;
    shutdown.cancel();
    handle.join().await;
    let after_stop = snapshots(dir.path()).len();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(snapshots(dir.path()).len(), after_stop);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshots_pause_while_a_client_streams() {
    let dir = tempfile::tempdir().unwrap();
    let camera = test_camera();

    let server = StreamingServer::bind("127.0.0.1:0".parse().unwrap(), camera.clone())
        .unwrap()
        .with_poll_interval(Duration::from_millis(100));
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(shutdown.clone()));

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 64];
    assert!(client.read(&mut buf).await.unwrap() > 0);
    assert!(camera.is_recording());

    let schedule = SnapshotSchedule::new(
        Duration::from_millis(100),
        CaptureWindow::Always,
        dir.path(),
    );
    let handle = SnapshotScheduler::new(schedule, camera.clone()).start(&shutdown);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(snapshots(dir.path()).is_empty());
    assert!(handle.is_running());

    drop(client);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(!camera.is_recording());
    assert!(!snapshots(dir.path()).is_empty());

    shutdown.cancel();
    handle.join().await;
    serving.await.unwrap().unwrap();
}
