//! Wires the camera, snapshot scheduler and streaming server together and
//! owns the shutdown path

use std::future::Future;
use std::io;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::camera::{self, CameraError};
use crate::server::{ServerError, StreamingServer};
use crate::snapshot::SnapshotScheduler;
use crate::{Config, ConfigError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("Camera startup task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until SIGINT/SIGTERM, which is the only clean way out
    pub async fn run(self) -> Result<(), RuntimeError> {
        let shutdown = CancellationToken::new();

        tokio::spawn(cancel_on_signal(wait_for_signal(), shutdown.clone()));
        self.run_until(shutdown).await
    }

    /// Start everything and serve until `shutdown` is cancelled.
    ///
    /// Configuration and camera errors surface before the listener or the
    /// timer exist.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<(), RuntimeError> {
        let config = self.config;
        config.validate()?;
        let settings = config.camera.settings();
        let schedule = if config.snapshot.enabled {
            Some(config.snapshot.schedule()?)
        } else {
            None
        };

        let camera = {
            let backend = config.camera.backend;
            let source = config.camera.source.clone();
            let settle = config.camera.settle();
            let settings = settings.clone();
            tokio::task::spawn_blocking(move || camera::open(backend, &source, &settings, settle))
                .await??
        };

        let server = StreamingServer::bind(config.listen_addr(), camera.clone())?
            .with_fatal_session_errors(config.server.fatal_session_errors)
            .with_stall_timeout(config.server.stall_timeout());

        let scheduler = schedule.map(|schedule| {
            SnapshotScheduler::new(schedule, camera.clone()).start(&shutdown)
        });

        let served = server.serve(shutdown.clone()).await;

        shutdown.cancel();
        if let Some(scheduler) = scheduler {
            scheduler.join().await;
        }
        served.map_err(Into::into)
    }
}

/// Cancel `trigger` once `signal` resolves. Without a working signal
/// handler the server keeps running and can still be stopped by other means.
async fn cancel_on_signal<F>(signal: F, trigger: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Terminating server.");
            trigger.cancel();
        }
        Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
